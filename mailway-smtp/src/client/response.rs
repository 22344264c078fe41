//! SMTP reply parsing.

use super::error::{ClientError, Result};

/// A complete, possibly multi-line SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Three-digit status code shared by every line.
    pub code: u16,
    /// Text of each line, code and separator stripped.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply rendered back into a single log-friendly string.
    #[must_use]
    pub fn text(&self) -> String {
        format!("{} {}", self.code, self.lines.join(" / "))
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx, e.g. the 354 go-ahead after DATA.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500
    }
}

/// One parsed reply line: code, text, and whether more lines follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ReplyLine {
    pub code: u16,
    pub text: String,
    pub more: bool,
}

impl ReplyLine {
    /// Parse `NNN<space-or-dash>text`. A bare three-digit line is a
    /// final line with empty text.
    pub(super) fn parse(line: &str) -> Result<Self> {
        let code = line
            .get(..3)
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| ClientError::Malformed(line.to_string()))?;
        let more = match line.as_bytes().get(3) {
            None | Some(b' ') => false,
            Some(b'-') => true,
            Some(_) => return Err(ClientError::Malformed(line.to_string())),
        };
        Ok(Self {
            code,
            text: line.get(4..).unwrap_or("").to_string(),
            more,
        })
    }
}

/// Accumulates reply lines until the final one arrives.
#[derive(Debug, Default)]
pub(super) struct ReplyBuilder {
    code: Option<u16>,
    lines: Vec<String>,
}

impl ReplyBuilder {
    /// Feed one line; returns the finished reply on the final line.
    /// Every line of a multi-line reply must carry the same code.
    pub(super) fn push(&mut self, line: &str) -> Result<Option<Response>> {
        let parsed = ReplyLine::parse(line)?;
        match self.code {
            Some(code) if code != parsed.code => {
                return Err(ClientError::Malformed(format!(
                    "code changed mid-reply: {code} then {}",
                    parsed.code
                )));
            }
            Some(_) => {}
            None => self.code = Some(parsed.code),
        }
        self.lines.push(parsed.text);
        if parsed.more {
            Ok(None)
        } else {
            let code = self.code.take().unwrap_or_default();
            Ok(Some(Response::new(code, std::mem::take(&mut self.lines))))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn final_line() {
        let line = ReplyLine::parse("250 At your service").unwrap();
        assert_eq!(line.code, 250);
        assert_eq!(line.text, "At your service");
        assert!(!line.more);
    }

    #[test]
    fn continuation_line() {
        let line = ReplyLine::parse("250-SIZE 10000000").unwrap();
        assert!(line.more);
    }

    #[test]
    fn bare_code_is_final() {
        let line = ReplyLine::parse("220").unwrap();
        assert_eq!(line.code, 220);
        assert_eq!(line.text, "");
        assert!(!line.more);
    }

    #[test]
    fn junk_is_rejected() {
        assert!(ReplyLine::parse("hi").is_err());
        assert!(ReplyLine::parse("2x0 nope").is_err());
        assert!(ReplyLine::parse("250_bad separator").is_err());
    }

    #[test]
    fn multi_line_reply_assembles() {
        let mut builder = ReplyBuilder::default();
        assert!(builder.push("250-mail.example.com").unwrap().is_none());
        assert!(builder.push("250-PIPELINING").unwrap().is_none());
        let reply = builder.push("250 HELP").unwrap().unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec!["mail.example.com", "PIPELINING", "HELP"]);
        assert!(reply.is_success());
    }

    #[test]
    fn code_change_mid_reply_is_malformed() {
        let mut builder = ReplyBuilder::default();
        builder.push("250-one").unwrap();
        assert!(builder.push("550 two").is_err());
    }

    #[test]
    fn classification() {
        assert!(Response::new(354, vec![]).is_intermediate());
        assert!(Response::new(550, vec![]).is_permanent_error());
        assert!(!Response::new(451, vec![]).is_permanent_error());
    }
}
