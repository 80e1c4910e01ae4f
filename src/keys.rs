use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{info, warn};

const MAX_NUMBERED_KEYS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub name: String,
    pub value: String,
}

/// Rotating set of API keys. Lines are spread over keys round-robin; a key
/// that fails is skipped until every key has failed, after which all keys
/// are tried again.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: Vec<ApiKey>,
    failed: Mutex<HashSet<String>>,
}

impl KeyRing {
    pub fn new(keys: Vec<ApiKey>) -> Self {
        Self {
            keys,
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// Collect `PREFIX` and `PREFIX_1` ..= `PREFIX_50` from the environment.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let names = std::iter::once(prefix.to_string())
            .chain((1..=MAX_NUMBERED_KEYS).map(|i| format!("{prefix}_{i}")));
        let keys: Vec<ApiKey> = names
            .filter_map(|name| {
                let value = lookup(&name)?;
                let value = value.trim().to_string();
                (!value.is_empty()).then_some(ApiKey { name, value })
            })
            .collect();
        info!("Loaded {} API key(s) from {}*", keys.len(), prefix);
        Self::new(keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Round-robin key for the `index`-th request.
    pub fn key_for(&self, index: usize) -> Option<&ApiKey> {
        if self.keys.is_empty() {
            return None;
        }
        let start = index % self.keys.len();
        self.first_working_from(start)
    }

    pub fn mark_failed(&self, name: &str) {
        if let Ok(mut failed) = self.failed.lock() {
            if failed.insert(name.to_string()) {
                warn!("API key {} marked as failed", name);
            }
        }
    }

    /// The next working key after `name` in ring order.
    pub fn next_working(&self, name: &str) -> Option<&ApiKey> {
        let pos = self.keys.iter().position(|k| k.name == name)?;
        self.first_working_from((pos + 1) % self.keys.len())
    }

    fn first_working_from(&self, start: usize) -> Option<&ApiKey> {
        let n = self.keys.len();
        let Ok(mut failed) = self.failed.lock() else {
            return self.keys.get(start);
        };
        if failed.len() >= n {
            info!("All API keys failed; resetting rotation");
            failed.clear();
        }
        (0..n)
            .map(|offset| &self.keys[(start + offset) % n])
            .find(|k| !failed.contains(&k.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ring(names: &[&str]) -> KeyRing {
        let env: HashMap<String, String> = names
            .iter()
            .map(|n| (n.to_string(), format!("secret-{n}")))
            .collect();
        KeyRing::from_lookup("GEMINI_API_KEY", |name| env.get(name).cloned())
    }

    #[test]
    fn collects_plain_and_numbered_keys() {
        let keys = ring(&["GEMINI_API_KEY", "GEMINI_API_KEY_2", "GEMINI_API_KEY_50"]);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys.key_for(0).unwrap().name, "GEMINI_API_KEY");
    }

    #[test]
    fn round_robin_by_index() {
        let keys = ring(&["GEMINI_API_KEY_1", "GEMINI_API_KEY_2"]);
        assert_eq!(keys.key_for(0).unwrap().name, "GEMINI_API_KEY_1");
        assert_eq!(keys.key_for(1).unwrap().name, "GEMINI_API_KEY_2");
        assert_eq!(keys.key_for(2).unwrap().name, "GEMINI_API_KEY_1");
    }

    #[test]
    fn failed_keys_are_skipped_then_reset() {
        let keys = ring(&["GEMINI_API_KEY_1", "GEMINI_API_KEY_2"]);
        keys.mark_failed("GEMINI_API_KEY_1");
        assert_eq!(keys.key_for(0).unwrap().name, "GEMINI_API_KEY_2");
        assert_eq!(keys.next_working("GEMINI_API_KEY_2").unwrap().name, "GEMINI_API_KEY_2");
        keys.mark_failed("GEMINI_API_KEY_2");
        assert_eq!(keys.key_for(0).unwrap().name, "GEMINI_API_KEY_1");
    }

    #[test]
    fn empty_ring_has_no_keys() {
        let keys = ring(&[]);
        assert!(keys.is_empty());
        assert!(keys.key_for(3).is_none());
    }
}
