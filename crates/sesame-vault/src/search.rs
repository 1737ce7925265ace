//! Item matching over index metadata. Pure functions, no I/O.
//!
//! - [`match_items`] — case-insensitive title substring or uuid prefix
//! - [`select_unique`] — resolve a pattern to exactly one item
//! - [`filter_by_location`] — items whose location has the same host as a URL

use sesame_keychain::{location_host, ItemMetadata};

use crate::error::VaultError;

/// Whether `item` matches `pattern`: its title contains the pattern, or its
/// uuid starts with it, ignoring case. An empty pattern matches everything.
#[must_use]
pub fn matches(item: &ItemMetadata, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    item.title.to_lowercase().contains(&pattern) || item.uuid.to_lowercase().starts_with(&pattern)
}

/// Items matching `pattern`, in input order.
#[must_use]
pub fn match_items<'a>(items: &'a [ItemMetadata], pattern: &str) -> Vec<&'a ItemMetadata> {
    items.iter().filter(|item| matches(item, pattern)).collect()
}

/// Resolve `pattern` to a single item. An exact uuid match wins over any
/// title matches.
///
/// # Errors
///
/// Returns `VaultError::NotFound` if nothing matches and
/// `VaultError::AmbiguousMatch` (carrying every candidate) if several do.
pub fn select_unique(items: &[ItemMetadata], pattern: &str) -> Result<ItemMetadata, VaultError> {
    if let Some(exact) = items.iter().find(|i| i.uuid.eq_ignore_ascii_case(pattern)) {
        return Ok(exact.clone());
    }

    let mut found = match_items(items, pattern);
    match found.len() {
        0 => Err(VaultError::NotFound(format!("no item matches {pattern:?}"))),
        1 => Ok(found.remove(0).clone()),
        _ => Err(VaultError::AmbiguousMatch {
            pattern: pattern.to_owned(),
            candidates: found.into_iter().cloned().collect(),
        }),
    }
}

/// Items whose location has the same host as `url`, in input order.
/// Unparseable URLs and locations never match.
#[must_use]
pub fn filter_by_location<'a>(items: &'a [ItemMetadata], url: &str) -> Vec<&'a ItemMetadata> {
    let Some(host) = location_host(url) else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| location_host(&item.location).as_deref() == Some(host.as_str()))
        .collect()
}
