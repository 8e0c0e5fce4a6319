//! Tolerant semantic version parsing for bundle `schemaVersion` fields.
//!
//! Bundle authors write schema versions as `"1.0.0"`, `"v1.0.0"`, or
//! occasionally a short `"1.0"` / `"1"`. This module accepts all of those
//! and compares them as proper semver so that `bundle::validate` can check
//! schema-version compatibility without rejecting the common `v`-prefixed
//! form first.
//!
//! ```rust
//! use cnab_core::semver_utils;
//!
//! let version = semver_utils::parse_version("v1.2.3");
//! assert!(version.is_some());
//! ```

use semver::Version;
use std::cmp::Ordering;

/// Parse a semantic version, tolerating a leading `v` and short
/// `major.minor` / `major` forms.
///
/// # Examples
///
/// ```rust
/// use cnab_core::semver_utils::parse_version;
///
/// assert!(parse_version("1.2.3").is_some());
/// assert!(parse_version("v1.2.3").is_some());
/// assert!(parse_version("1.2").is_some());
/// assert!(parse_version("1").is_some());
/// assert!(parse_version("invalid").is_none());
/// ```
pub fn parse_version(tag: &str) -> Option<Version> {
    let version_str = tag.strip_prefix('v').unwrap_or(tag);

    if let Ok(version) = Version::parse(version_str) {
        return Some(version);
    }

    if let Ok(version) = Version::parse(&format!("{}.0", version_str)) {
        return Some(version);
    }

    if let Ok(version) = Version::parse(&format!("{}.0.0", version_str)) {
        return Some(version);
    }

    None
}

/// Compare two version strings, tolerating the same forms as [`parse_version`].
///
/// A valid semantic version is considered greater than an unparseable one;
/// two unparseable strings fall back to lexical comparison.
///
/// # Examples
///
/// ```rust
/// use cnab_core::semver_utils::compare_versions;
/// use std::cmp::Ordering;
///
/// assert_eq!(compare_versions("1.2.3", "1.2.4"), Ordering::Less);
/// assert_eq!(compare_versions("2.0.0", "1.9.9"), Ordering::Greater);
/// assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
/// assert_eq!(compare_versions("1.0.0", "invalid"), Ordering::Greater);
/// ```
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(v_a), Some(v_b)) => v_a.cmp(&v_b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// `true` if `tag` is not `"latest"` and parses as a semantic version.
///
/// Bundle versions must satisfy exactly this per the bundle invariant that
/// `version` may never be the literal string `"latest"`.
pub fn is_valid_bundle_version(tag: &str) -> bool {
    tag != "latest" && parse_version(tag).is_some()
}
