//! Stable project identifiers.
//!
//! A project's id is derived from `(name, path)` and never stored separately
//! from them: the same pair always yields the same id, on every call site.
//! This is a practical hash, not a cryptographic one. Distinct pairs collide
//! only with negligible probability for realistic project sets.

const PREFIX_LEN: usize = 6;
const MAX_ID_LEN: usize = 16;
const MIN_ID_LEN: usize = 8;
const PADDING: &str = "00000000";

/// Derives the stable id for a project.
///
/// `name + "|" + path` is hashed with a 32-bit rolling hash
/// (`h = h * 31 + unit`, wrapping) over UTF-16 code units. The absolute value
/// is rendered in base 36 and prefixed with up to six ASCII alphanumerics from
/// `name`. The result is 8 to 16 characters long.
pub fn stable_project_id(name: &str, path: &str) -> String {
    let hash = base36(rolling_hash(&format!("{}|{}", name, path)).unsigned_abs());

    let prefix: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(PREFIX_LEN)
        .collect();

    let mut id: String = format!("{}{}", prefix, hash)
        .chars()
        .take(MAX_ID_LEN)
        .collect();

    if id.len() < MIN_ID_LEN {
        id = format!("{}{}{}", id, hash, PADDING)
            .chars()
            .take(MAX_ID_LEN)
            .collect();
    }

    id
}

fn rolling_hash(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    })
}

fn base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
