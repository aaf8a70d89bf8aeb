//! Slug derivation for sources and symbols.

use crate::errors::{AppError, AppResult};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NON_SLUG_CHARS: Regex =
        Regex::new(r"[^a-z0-9]+").expect("Invalid slug separator pattern");
    static ref VALID_SLUG: Regex =
        Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("Invalid slug pattern");
}

/// Derive a URL-safe slug from a human-readable name.
///
/// Runs of characters other than ASCII letters and digits collapse to a single `-`.
/// Names with no usable characters are rejected.
pub fn slugify(name: &str) -> AppResult<String> {
    let lowered = name.trim().to_lowercase();
    let slug = NON_SLUG_CHARS
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string();

    if slug.is_empty() {
        return Err(AppError::Validation(format!(
            "Cannot derive a slug from name: {:?}",
            name
        )));
    }
    Ok(slug)
}

/// Check that a caller-supplied slug is already in canonical form
pub fn validate_slug(slug: &str) -> AppResult<()> {
    if VALID_SLUG.is_match(slug) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid slug: {:?}", slug)))
    }
}

/// Slug for the `n`-th holder of a base slug (`n = 1` is the base itself)
pub fn disambiguate(base: &str, n: u32) -> String {
    if n <= 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_collapses_separators() {
        assert_eq!(slugify("Seal of  Mars").unwrap(), "seal-of-mars");
        assert_eq!(slugify("  --Key of Solomon (1889)-- ").unwrap(), "key-of-solomon-1889");
    }

    #[test]
    fn test_slugify_rejects_empty_names() {
        assert!(slugify("").is_err());
        assert!(slugify("***").is_err());
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("picatrix").is_ok());
        assert!(validate_slug("book-of-raziel-2").is_ok());
        assert!(validate_slug("Book").is_err());
        assert!(validate_slug("a--b").is_err());
        assert!(validate_slug("-a").is_err());
    }

    #[test]
    fn test_disambiguate() {
        assert_eq!(disambiguate("sigil", 1), "sigil");
        assert_eq!(disambiguate("sigil", 3), "sigil-3");
    }
}
