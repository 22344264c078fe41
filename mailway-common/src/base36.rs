//! Base-36 integers, the radix used for timestamps embedded in queue
//! file names.

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode a non-negative integer in lowercase base 36.
#[must_use]
pub fn encode(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    // DIGITS is pure ASCII
    String::from_utf8(out).unwrap_or_default()
}

/// Decode a lowercase base-36 string. Returns `None` on empty input,
/// invalid digits, or overflow.
#[must_use]
pub fn decode(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for byte in text.bytes() {
        let digit = match byte {
            b'0'..=b'9' => u64::from(byte - b'0'),
            b'a'..=b'z' => u64::from(byte - b'a') + 10,
            _ => return None,
        };
        value = value.checked_mul(36)?.checked_add(digit)?;
    }
    Some(value)
}
