//! Configuration access.
//!
//! The pipeline never owns a configuration store; hosts hand in anything
//! implementing [`Config`]. Missing or ill-typed keys read as undefined and
//! the caller applies its default. [`MemoryConfig`] is the bundled
//! JSON-value-backed implementation used by hosts with serde-native settings
//! and by the test suite.

use std::collections::BTreeMap;

use serde_json::Value;

/// Capability set for reading typed configuration values.
///
/// Every getter returns `None` for both missing and unexpectedly-typed
/// values. Implementations must be callable from any thread.
pub trait Config: Send + Sync {
    fn get_str(&self, key: &str) -> Option<String>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_uint32(&self, key: &str) -> Option<u32>;
    fn get_float(&self, key: &str) -> Option<f32>;
    fn get_bool(&self, key: &str) -> Option<bool>;

    /// Visits every string value whose key starts with `prefix`, in key
    /// order. The visitor returns `false` to stop early; the method returns
    /// `false` iff iteration was stopped.
    fn each_string(&self, prefix: &str, visit: &mut dyn FnMut(&str, &str) -> bool) -> bool;
}

/// In-memory [`Config`] backed by `serde_json::Value` entries.
#[derive(Debug, Default, Clone)]
pub struct MemoryConfig {
    values: BTreeMap<String, Value>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Removes a key, making it read as undefined.
    pub fn unset(&mut self, key: &str) -> &mut Self {
        self.values.remove(key);
        self
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for MemoryConfig {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Config for MemoryConfig {
    fn get_str(&self, key: &str) -> Option<String> {
        self.values.get(key)?.as_str().map(str::to_owned)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key)?.as_i64()
    }

    fn get_uint32(&self, key: &str) -> Option<u32> {
        self.values.get(key)?.as_u64()?.try_into().ok()
    }

    fn get_float(&self, key: &str) -> Option<f32> {
        self.values.get(key)?.as_f64().map(|v| v as f32)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key)?.as_bool()
    }

    fn each_string(&self, prefix: &str, visit: &mut dyn FnMut(&str, &str) -> bool) -> bool {
        for (key, value) in self.values.range(prefix.to_owned()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(s) = value.as_str() {
                if !visit(key, s) {
                    return false;
                }
            }
        }
        true
    }
}

/// An empty configuration: every key reads as undefined, so objects fall
/// back to their defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyConfig;

impl Config for EmptyConfig {
    fn get_str(&self, _key: &str) -> Option<String> {
        None
    }

    fn get_int(&self, _key: &str) -> Option<i64> {
        None
    }

    fn get_uint32(&self, _key: &str) -> Option<u32> {
        None
    }

    fn get_float(&self, _key: &str) -> Option<f32> {
        None
    }

    fn get_bool(&self, _key: &str) -> Option<bool> {
        None
    }

    fn each_string(&self, _prefix: &str, _visit: &mut dyn FnMut(&str, &str) -> bool) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryConfig {
        let mut cfg = MemoryConfig::new();
        cfg.set("video-width", 1280)
            .set("video-height", 720)
            .set("volume", 0.5)
            .set("master", true)
            .set("url", "rtmp://ingest.example/live")
            .set("url-key", "stream-1");
        cfg
    }

    #[test]
    fn typed_reads_return_values() {
        let cfg = sample();
        assert_eq!(cfg.get_int("video-width"), Some(1280));
        assert_eq!(cfg.get_uint32("video-height"), Some(720));
        assert_eq!(cfg.get_float("volume"), Some(0.5));
        assert_eq!(cfg.get_bool("master"), Some(true));
        assert_eq!(
            cfg.get_str("url").as_deref(),
            Some("rtmp://ingest.example/live")
        );
    }

    #[test]
    fn missing_and_ill_typed_keys_read_as_undefined() {
        let cfg = sample();
        assert_eq!(cfg.get_int("missing"), None);
        assert_eq!(cfg.get_bool("volume"), None);
        assert_eq!(cfg.get_str("video-width"), None);
        assert_eq!(cfg.get_uint32("volume"), None);
    }

    #[test]
    fn negative_values_are_not_uint32() {
        let mut cfg = MemoryConfig::new();
        cfg.set("divisor", -2);
        assert_eq!(cfg.get_uint32("divisor"), None);
        assert_eq!(cfg.get_int("divisor"), Some(-2));
    }

    #[test]
    fn each_string_visits_prefix_in_order() {
        let cfg = sample();
        let mut seen = Vec::new();
        let completed = cfg.each_string("url", &mut |key, value| {
            seen.push((key.to_owned(), value.to_owned()));
            true
        });
        assert!(completed);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "url");
        assert_eq!(seen[1].1, "stream-1");
    }

    #[test]
    fn each_string_can_stop_early() {
        let cfg = sample();
        let mut count = 0;
        let completed = cfg.each_string("url", &mut |_, _| {
            count += 1;
            false
        });
        assert!(!completed);
        assert_eq!(count, 1);
    }
}
