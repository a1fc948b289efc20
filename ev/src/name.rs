//! Event name and key validation

use std::borrow::Cow;

use crate::error::{EventError, Result};

/// Normalize an event or target name
///
/// Names are lowercase `[a-z0-9_/.]`; ASCII uppercase is folded and a run of
/// underscores collapses into one. Returns the input unchanged (borrowed) when
/// it is already normal, so parsed names stay zero-copy.
pub fn normalize_name(raw: &str) -> Result<Cow<'_, str>> {
    if raw.is_empty() {
        return Err(EventError::InvalidName(String::new()));
    }

    let mut changed = false;
    let mut prev_underscore = false;
    for c in raw.bytes() {
        match c {
            b'a'..=b'z' | b'0'..=b'9' | b'/' | b'.' => prev_underscore = false,
            b'A'..=b'Z' => {
                changed = true;
                prev_underscore = false;
            }
            b'_' => {
                if prev_underscore {
                    changed = true;
                }
                prev_underscore = true;
            }
            _ => return Err(EventError::InvalidName(raw.to_string())),
        }
    }

    if !changed {
        return Ok(Cow::Borrowed(raw));
    }

    let mut out = String::with_capacity(raw.len());
    let mut prev_underscore = false;
    for c in raw.bytes() {
        if c == b'_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(char::from(c.to_ascii_lowercase()));
            prev_underscore = false;
        }
    }
    Ok(Cow::Owned(out))
}

/// Attribute keys and variable names: non-empty `[A-Za-z0-9_.-]`
pub fn is_valid_key(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'-'))
}

pub(crate) fn check_key(raw: &str) -> Result<()> {
    if is_valid_key(raw) {
        Ok(())
    } else {
        Err(EventError::InvalidName(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_name_is_borrowed() {
        let n = normalize_name("net/link.up").unwrap();
        assert!(matches!(n, Cow::Borrowed(_)));
        assert_eq!(n, "net/link.up");
    }

    #[test]
    fn test_uppercase_folded() {
        assert_eq!(normalize_name("Ping").unwrap(), "ping");
    }

    #[test]
    fn test_underscore_runs_collapse() {
        assert_eq!(normalize_name("a__b___c").unwrap(), "a_b_c");
        assert_eq!(normalize_name("__x").unwrap(), "_x");
    }

    #[test]
    fn test_illegal_chars() {
        assert!(matches!(normalize_name("a b"), Err(EventError::InvalidName(_))));
        assert!(matches!(normalize_name("a:b"), Err(EventError::InvalidName(_))));
        assert!(matches!(normalize_name(""), Err(EventError::InvalidName(_))));
    }

    #[test]
    fn test_keys() {
        assert!(is_valid_key("_date"));
        assert!(is_valid_key("Content-Type"));
        assert!(!is_valid_key("a/b"));
        assert!(!is_valid_key(""));
    }
}
