//! Product keys, storage-key encoding, and alias resolution.
//!
//! A purchased product may be referenced by several equivalent keys
//! (catalog id, external product id, payment-provider id). Entitlement is
//! logically keyed by the canonical key, but every lookup, update, and
//! reset acts on the whole alias set, so a delete or query against any
//! alias behaves as if issued against all of them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Longest accepted product key. Catalog ids and payment-provider ids are
/// all far below this.
pub const MAX_PRODUCT_KEY_LEN: usize = 200;

/// Validate a caller-supplied product key.
///
/// Rejects empty and whitespace-only keys, keys with control characters,
/// over-long keys, and keys containing `:` (reserved by the storage-key
/// codec).
pub fn validate_product_key(key: &str) -> Result<(), String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err("product key is empty".to_string());
    }
    if trimmed != key {
        return Err(format!("product key has leading or trailing whitespace: {key:?}"));
    }
    if key.len() > MAX_PRODUCT_KEY_LEN {
        return Err(format!("product key exceeds {MAX_PRODUCT_KEY_LEN} bytes"));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err("product key contains control characters".to_string());
    }
    if key.contains(':') {
        return Err(format!("product key contains reserved ':' separator: {key:?}"));
    }
    Ok(())
}

/// Encodes product keys into storage keys.
///
/// Injectable so alias resolution and storage layout can never collide by
/// accident; the default emits the layout the storefront already uses:
/// `entitlement:{productKey}` and `cooldown:{productKey}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCodec {
    entitlement_prefix: String,
    cooldown_prefix: String,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self {
            entitlement_prefix: "entitlement:".to_string(),
            cooldown_prefix: "cooldown:".to_string(),
        }
    }
}

impl KeyCodec {
    /// Codec with custom prefixes. Prefixes must be non-empty and distinct
    /// or decoding becomes ambiguous.
    pub fn new(entitlement_prefix: impl Into<String>, cooldown_prefix: impl Into<String>) -> Self {
        Self {
            entitlement_prefix: entitlement_prefix.into(),
            cooldown_prefix: cooldown_prefix.into(),
        }
    }

    /// Storage key of the entitlement record for `product_key`.
    pub fn entitlement_key(&self, product_key: &str) -> String {
        format!("{}{}", self.entitlement_prefix, product_key)
    }

    /// Storage key of the cooldown marker for `product_key`.
    pub fn cooldown_key(&self, product_key: &str) -> String {
        format!("{}{}", self.cooldown_prefix, product_key)
    }

    /// Product key of an entitlement storage key, if it is one.
    pub fn product_key_of<'a>(&self, storage_key: &'a str) -> Option<&'a str> {
        storage_key.strip_prefix(&self.entitlement_prefix)
    }
}

/// The full set of keys referring to one purchased product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AliasSet {
    /// The key entitlement is logically filed under.
    pub canonical: String,
    /// Every equivalent key, canonical included, no duplicates.
    pub keys: Vec<String>,
}

impl AliasSet {
    /// Set containing only the key itself.
    pub fn singleton(key: &str) -> Self {
        Self {
            canonical: key.to_string(),
            keys: vec![key.to_string()],
        }
    }
}

/// Resolves a product key to its alias set.
///
/// The catalog collaborator owning alias knowledge sits behind this seam;
/// unknown keys resolve to themselves.
pub trait AliasResolver: Send + Sync {
    fn resolve(&self, product_key: &str) -> AliasSet;
}

/// Table-driven resolver: groups of equivalent keys, first entry canonical.
///
/// With no groups configured it degrades to identity resolution, which is
/// the common single-key case.
#[derive(Debug, Default)]
pub struct StaticAliasResolver {
    groups: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl StaticAliasResolver {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        let mut index = HashMap::new();
        let groups: Vec<Vec<String>> = groups
            .into_iter()
            .filter(|group| !group.is_empty())
            .collect();
        for (i, group) in groups.iter().enumerate() {
            for key in group {
                index.insert(key.clone(), i);
            }
        }
        Self { groups, index }
    }
}

impl AliasResolver for StaticAliasResolver {
    fn resolve(&self, product_key: &str) -> AliasSet {
        match self.index.get(product_key) {
            Some(&i) => {
                let group = &self.groups[i];
                let mut keys = Vec::with_capacity(group.len());
                for key in group {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
                AliasSet {
                    canonical: group[0].clone(),
                    keys,
                }
            }
            None => AliasSet::singleton(product_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_normal_keys() {
        assert!(validate_product_key("ultimate-bundle").is_ok());
        assert!(validate_product_key("prod_8f3k2").is_ok());
        assert!(validate_product_key("SKU 42").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_keys() {
        assert!(validate_product_key("").is_err());
        assert!(validate_product_key("   ").is_err());
        assert!(validate_product_key(" padded ").is_err());
        assert!(validate_product_key("has:colon").is_err());
        assert!(validate_product_key("ctrl\x07char").is_err());
        assert!(validate_product_key(&"x".repeat(MAX_PRODUCT_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_default_codec_matches_storefront_layout() {
        let codec = KeyCodec::default();
        assert_eq!(codec.entitlement_key("bundle"), "entitlement:bundle");
        assert_eq!(codec.cooldown_key("bundle"), "cooldown:bundle");
        assert_eq!(codec.product_key_of("entitlement:bundle"), Some("bundle"));
        assert_eq!(codec.product_key_of("cooldown:bundle"), None);
        assert_eq!(codec.product_key_of("unrelated"), None);
    }

    #[test]
    fn test_custom_codec() {
        let codec = KeyCodec::new("ent/", "cd/");
        assert_eq!(codec.entitlement_key("k"), "ent/k");
        assert_eq!(codec.cooldown_key("k"), "cd/k");
        assert_eq!(codec.product_key_of("ent/k"), Some("k"));
    }

    #[test]
    fn test_unknown_key_resolves_to_itself() {
        let resolver = StaticAliasResolver::default();
        let set = resolver.resolve("lonely");
        assert_eq!(set.canonical, "lonely");
        assert_eq!(set.keys, vec!["lonely".to_string()]);
    }

    #[test]
    fn test_any_member_resolves_whole_group() {
        let resolver = StaticAliasResolver::new(vec![vec![
            "bundle".to_string(),
            "prod_123".to_string(),
            "pp_A7".to_string(),
        ]]);

        for alias in ["bundle", "prod_123", "pp_A7"] {
            let set = resolver.resolve(alias);
            assert_eq!(set.canonical, "bundle");
            assert_eq!(set.keys.len(), 3);
            assert!(set.keys.contains(&alias.to_string()));
        }
    }

    #[test]
    fn test_duplicate_group_entries_are_deduped() {
        let resolver =
            StaticAliasResolver::new(vec![vec!["a".to_string(), "b".to_string(), "a".to_string()]]);
        let set = resolver.resolve("b");
        assert_eq!(set.keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_empty_groups_are_ignored() {
        let resolver = StaticAliasResolver::new(vec![vec![], vec!["x".to_string()]]);
        assert_eq!(resolver.resolve("x").canonical, "x");
        assert_eq!(resolver.resolve("y").canonical, "y");
    }
}
