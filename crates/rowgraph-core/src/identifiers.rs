//! Mapping name validation.
//!
//! Entity, attribute, relationship and column names end up as map keys,
//! flat-row prefixes (`"paintings.NAME"`) and log output. They are restricted
//! to identifier characters plus the dot used for joined paths.

use std::sync::OnceLock;

use regex::Regex;

use crate::Result;
use crate::error::{Error, MappingErrorKind};

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").ok())
        .as_ref()
}

/// Whether `name` can be used as a mapping name.
pub fn is_valid_name(name: &str) -> bool {
    match name_pattern() {
        Some(re) => re.is_match(name) && !name.ends_with('.') && !name.contains(".."),
        None => false,
    }
}

/// Fail with a mapping error naming `what` when `name` is not valid.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::mapping(
            MappingErrorKind::InvalidName,
            format!("invalid {what} name '{name}'"),
        ))
    }
}

/// Split a dotted relationship path into its segments.
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("Artist"));
        assert!(is_valid_name("ARTIST_ID"));
        assert!(is_valid_name("_private"));
        assert!(is_valid_name("paintings.gallery"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("1abc"));
        assert!(!is_valid_name("a b"));
        assert!(!is_valid_name("name;DROP"));
        assert!(!is_valid_name("a."));
        assert!(!is_valid_name("a..b"));
    }

    #[test]
    fn test_validate_name_error() {
        let err = validate_name("entity", "bad name").unwrap_err();
        assert!(err.is_fatal_mapping());
        assert!(err.to_string().contains("bad name"));
    }

    #[test]
    fn test_split_path() {
        let parts: Vec<_> = split_path("paintings.gallery").collect();
        assert_eq!(parts, vec!["paintings", "gallery"]);
    }
}
