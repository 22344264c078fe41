//! Relay authorization: per-domain alias expansion and sender allow-lists.
//!
//! The control table maps each accepted domain to a set of named entries.
//! An entry whose name is a local-part is an alias; its expansion list
//! holds terminal addresses (entries containing `@`) and further alias
//! names (entries without `@`). The `@` entry, when present, is the
//! domain's catch-all route for local-parts with no alias of their own.
//! An entry whose name is a full address is a sender allow-list: the
//! sender must be listed to relay through the domain, and a non-empty
//! list restricts which local-parts that sender may address.

use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use thiserror::Error;
use tracing::{debug, error};

/// Denied relay attempt; the payload is the address the denial is about
/// (the recipient for routing failures, the sender for authorization
/// failures). The display form is the text returned in the 553 reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Relay denied for {0}")]
pub struct RelayDenied(pub String);

/// The compiled relay control table.
#[derive(Debug, Default, Clone)]
pub struct RelayTable {
    domains: AHashMap<String, AHashMap<String, Vec<String>>>,
}

impl RelayTable {
    /// Compile the table from its configuration form.
    #[must_use]
    pub fn new(routing: &BTreeMap<String, BTreeMap<String, Vec<String>>>) -> Self {
        let domains = routing
            .iter()
            .map(|(domain, entries)| {
                (
                    domain.clone(),
                    entries
                        .iter()
                        .map(|(name, list)| (name.clone(), list.clone()))
                        .collect(),
                )
            })
            .collect();
        Self { domains }
    }

    /// Returns `true` when the given destination domain is routed at all.
    #[must_use]
    pub fn accepts(&self, domain: &str) -> bool {
        self.domains.contains_key(domain)
    }

    /// Authorize a normalized `user@domain` recipient for the given
    /// sender and expand it to its terminal addresses.
    ///
    /// # Errors
    ///
    /// Returns [`RelayDenied`] when the address has no routed domain, no
    /// alias (and no catch-all), or the sender is not permitted to
    /// address this local-part.
    pub fn authorize(&self, addr: &str, sender: &str) -> Result<Vec<String>, RelayDenied> {
        let Some((local, domain)) = addr.split_once('@').filter(|(l, d)| !l.is_empty() && !d.is_empty())
        else {
            return Err(RelayDenied(addr.to_string()));
        };

        let Some(entries) = self.domains.get(domain) else {
            return Err(RelayDenied(addr.to_string()));
        };

        let (alias, expansion) = match entries.get(local) {
            Some(list) => (local, list),
            None => match entries.get("@") {
                Some(list) => ("@", list),
                None => return Err(RelayDenied(addr.to_string())),
            },
        };

        let Some(allowed) = entries.get(sender) else {
            return Err(RelayDenied(sender.to_string()));
        };
        if !allowed.is_empty() && !allowed.iter().any(|name| name == local) {
            return Err(RelayDenied(sender.to_string()));
        }

        let mut visited = AHashSet::new();
        visited.insert(alias.to_string());
        let mut terminals = AHashSet::new();
        expand(entries, expansion, &mut visited, &mut terminals);

        let mut terminals: Vec<String> = terminals.into_iter().collect();
        terminals.sort_unstable();
        Ok(terminals)
    }
}

/// Recursively expand an alias list, collecting terminal addresses.
///
/// The visited set fails closed on cycles: an alias name seen twice on
/// any path is a configuration error and is skipped, not re-expanded.
fn expand(
    entries: &AHashMap<String, Vec<String>>,
    list: &[String],
    visited: &mut AHashSet<String>,
    terminals: &mut AHashSet<String>,
) {
    for name in list {
        let at = name.find('@');
        if at.is_some_and(|at| at > 0 && at < name.len() - 1) {
            debug!("  => {name}");
            terminals.insert(name.clone());
        } else if visited.contains(name) {
            error!("CFGERR: cyclic alias: {name}");
        } else if let Some(expansion) = entries.get(name) {
            debug!("  => [{name}, {} entries]", expansion.len());
            visited.insert(name.clone());
            expand(entries, expansion, visited, terminals);
        } else {
            error!("CFGERR: unresolved alias: {name}");
        }
    }
}
