use crate::constants::{DEFAULT_KEY_PREFIX, DEFAULT_LOCK_PREFIX, EVICTED_SEGMENT};
use crate::types::SessionKey;

/// Builds the deterministic backend key names for a (prefix, type, user key)
/// triple. Type names are folded to ASCII lowercase so every caller lands on
/// the same keys regardless of how the type name was spelled.
#[derive(Debug, Clone)]
pub struct KeyNamer {
    key_prefix: String,
    lock_prefix: String,
}

impl KeyNamer {
    pub fn new(key_prefix: impl Into<String>, lock_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            lock_prefix: lock_prefix.into(),
        }
    }

    /// `<key_prefix>:<type>:<user_key>`
    pub fn active_key(&self, type_name: &str, key: &SessionKey) -> String {
        format!(
            "{}:{}:{}",
            self.key_prefix,
            type_name.to_ascii_lowercase(),
            key
        )
    }

    /// `<key_prefix>:evicted:<type>:<user_key>`
    pub fn evicted_key(&self, type_name: &str, key: &SessionKey) -> String {
        format!(
            "{}:{}:{}:{}",
            self.key_prefix,
            EVICTED_SEGMENT,
            type_name.to_ascii_lowercase(),
            key
        )
    }

    /// `<key_prefix>:<lock_prefix>:<type>:<user_key>`
    pub fn lock_name(&self, type_name: &str, key: &SessionKey) -> String {
        format!(
            "{}:{}:{}:{}",
            self.key_prefix,
            self.lock_prefix,
            type_name.to_ascii_lowercase(),
            key
        )
    }
}

impl Default for KeyNamer {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX, DEFAULT_LOCK_PREFIX)
    }
}
