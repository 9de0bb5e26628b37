//! Immutable, hashable settings shared by every actor of a controller.
//!
//! Settings are a nested JSON-like mapping, built once and validated at
//! construction. The runtime reads these keys (all optional):
//!
//! | key | type | default |
//! |---|---|---|
//! | `spider.concurrency` (or top-level `concurrency`) | integer ≥ 1 | 10 |
//! | `spider.stop_when_empty` (or top-level `stop_when_empty`) | bool | true |
//! | `fetcher.qps` | integer ≥ 1 | 100 |
//! | `fetcher.max_qps` | integer ≥ `qps` | max(200, qps) |
//! | `fetcher.rate_limit` | bool | true |
//! | `saver.run_until_complete` | bool | true |
//! | `controller.poll_interval_ms` | integer ≥ 1 | 100 |
//!
//! Any other key is kept and can be read with [`Settings::get`] using a
//! dotted path.

use crate::error::{Result, SpiderError};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONCURRENCY: u64 = 10;
const DEFAULT_QPS: u64 = 100;
const DEFAULT_MAX_QPS: u64 = 200;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug)]
struct Resolved {
    concurrency: usize,
    stop_when_empty: bool,
    qps: u32,
    max_qps: u32,
    rate_limit: bool,
    run_until_complete: bool,
    poll_interval: Duration,
}

#[derive(Debug)]
struct Inner {
    values: Map<String, Value>,
    hash: u64,
    resolved: Resolved,
}

/// Cheap to clone; every clone shares the same immutable mapping.
#[derive(Clone)]
pub struct Settings {
    inner: Arc<Inner>,
}

impl Settings {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Self::from_map(values),
            other => Err(SpiderError::Settings(format!(
                "settings must be a mapping, got {}",
                other
            ))),
        }
    }

    pub fn from_map(values: Map<String, Value>) -> Result<Self> {
        let resolved = resolve(&values)?;
        // serde_json maps are ordered by key, so this rendering is canonical.
        let mut hasher = DefaultHasher::new();
        Value::Object(values.clone()).to_string().hash(&mut hasher);
        Ok(Self {
            inner: Arc::new(Inner {
                values,
                hash: hasher.finish(),
                resolved,
            }),
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(s)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Self::from_value(toml::from_str::<Value>(s)?)
    }

    /// Loads a `.json` or `.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            Some("toml") => Self::from_toml_str(&contents),
            _ => Err(SpiderError::Settings(format!(
                "unsupported settings file '{}', expected .json or .toml",
                path.display()
            ))),
        }
    }

    /// Returns a new instance with `overrides` merged on top (recursively for
    /// nested mappings). `self` is left untouched.
    pub fn merged(&self, overrides: Value) -> Result<Self> {
        let mut values = Value::Object(self.inner.values.clone());
        merge(&mut values, overrides);
        Self::from_value(values)
    }

    /// Looks up a dotted path such as `"fetcher.qps"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.inner.values, path)
    }

    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.get(path)
            .map(|v| T::deserialize(v).map_err(SpiderError::from))
            .transpose()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.inner.values
    }

    pub fn concurrency(&self) -> usize {
        self.inner.resolved.concurrency
    }

    pub fn stop_when_empty(&self) -> bool {
        self.inner.resolved.stop_when_empty
    }

    pub fn fetcher_qps(&self) -> u32 {
        self.inner.resolved.qps
    }

    pub fn fetcher_max_qps(&self) -> u32 {
        self.inner.resolved.max_qps
    }

    pub fn rate_limit(&self) -> bool {
        self.inner.resolved.rate_limit
    }

    pub fn saver_run_until_complete(&self) -> bool {
        self.inner.resolved.run_until_complete
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.resolved.poll_interval
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                values: Map::new(),
                hash: {
                    let mut hasher = DefaultHasher::new();
                    Value::Object(Map::new()).to_string().hash(&mut hasher);
                    hasher.finish()
                },
                resolved: Resolved {
                    concurrency: DEFAULT_CONCURRENCY as usize,
                    stop_when_empty: true,
                    qps: DEFAULT_QPS as u32,
                    max_qps: DEFAULT_MAX_QPS as u32,
                    rate_limit: true,
                    run_until_complete: true,
                    poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
                },
            }),
        }
    }
}

impl PartialEq for Settings {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.values == other.inner.values
    }
}

impl Eq for Settings {}

impl Hash for Settings {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.inner.hash);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Settings").field(&self.inner.values).finish()
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.inner.values.clone()))
    }
}

fn lookup<'a>(values: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = values.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn first<'a>(values: &'a Map<String, Value>, paths: &[&str]) -> Option<(&'a Value, String)> {
    paths
        .iter()
        .find_map(|p| lookup(values, p).map(|v| (v, p.to_string())))
}

fn positive_int(values: &Map<String, Value>, paths: &[&str], default: u64) -> Result<u64> {
    match first(values, paths) {
        None => Ok(default),
        Some((value, path)) => match value.as_u64() {
            Some(n) if n >= 1 => Ok(n),
            _ => Err(SpiderError::Settings(format!(
                "'{}' must be a positive integer, got {}",
                path, value
            ))),
        },
    }
}

fn boolean(values: &Map<String, Value>, paths: &[&str], default: bool) -> Result<bool> {
    match first(values, paths) {
        None => Ok(default),
        Some((Value::Bool(b), _)) => Ok(*b),
        Some((value, path)) => Err(SpiderError::Settings(format!(
            "'{}' must be a boolean, got {}",
            path, value
        ))),
    }
}

fn to_u32(n: u64, path: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| SpiderError::Settings(format!("'{}' is too large: {}", path, n)))
}

fn resolve(values: &Map<String, Value>) -> Result<Resolved> {
    let concurrency = positive_int(
        values,
        &["spider.concurrency", "concurrency"],
        DEFAULT_CONCURRENCY,
    )?;
    let qps = to_u32(positive_int(values, &["fetcher.qps"], DEFAULT_QPS)?, "fetcher.qps")?;
    let max_qps = to_u32(
        positive_int(
            values,
            &["fetcher.max_qps"],
            DEFAULT_MAX_QPS.max(u64::from(qps)),
        )?,
        "fetcher.max_qps",
    )?;
    if qps > max_qps {
        return Err(SpiderError::Settings(format!(
            "'fetcher.qps' ({}) must not exceed 'fetcher.max_qps' ({})",
            qps, max_qps
        )));
    }
    let poll_interval_ms = positive_int(
        values,
        &["controller.poll_interval_ms"],
        DEFAULT_POLL_INTERVAL_MS,
    )?;

    Ok(Resolved {
        concurrency: usize::try_from(concurrency)
            .map_err(|_| SpiderError::Settings(format!("concurrency is too large: {}", concurrency)))?,
        stop_when_empty: boolean(
            values,
            &["spider.stop_when_empty", "stop_when_empty"],
            true,
        )?,
        qps,
        max_qps,
        rate_limit: boolean(values, &["fetcher.rate_limit"], true)?,
        run_until_complete: boolean(values, &["saver.run_until_complete"], true)?,
        poll_interval: Duration::from_millis(poll_interval_ms),
    })
}

fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::io::Write;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.concurrency(), 10);
        assert!(settings.stop_when_empty());
        assert_eq!(settings.fetcher_qps(), 100);
        assert_eq!(settings.fetcher_max_qps(), 200);
        assert!(settings.rate_limit());
        assert!(settings.saver_run_until_complete());
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));
        assert_eq!(settings, Settings::from_value(json!({})).unwrap());
    }

    #[test]
    fn nested_keys_and_fallbacks() {
        let settings = Settings::from_value(json!({
            "concurrency": 3,
            "spider": {"stop_when_empty": false},
            "fetcher": {"qps": 2, "max_qps": 4},
            "custom": {"depth": 7}
        }))
        .unwrap();
        assert_eq!(settings.concurrency(), 3);
        assert!(!settings.stop_when_empty());
        assert_eq!(settings.fetcher_qps(), 2);
        assert_eq!(settings.fetcher_max_qps(), 4);
        assert_eq!(settings.get("custom.depth"), Some(&json!(7)));
        assert_eq!(settings.get_as::<u32>("custom.depth").unwrap(), Some(7));
        assert_eq!(settings.get("custom.missing"), None);
    }

    #[test]
    fn max_qps_follows_a_large_qps() {
        let settings = Settings::from_value(json!({"fetcher": {"qps": 500}})).unwrap();
        assert_eq!(settings.fetcher_max_qps(), 500);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for bad in [
            json!({"spider": {"concurrency": 0}}),
            json!({"concurrency": "many"}),
            json!({"fetcher": {"qps": 5, "max_qps": 4}}),
            json!({"fetcher": {"qps": -1}}),
            json!({"stop_when_empty": "yes"}),
            json!([1, 2]),
        ] {
            assert!(
                matches!(Settings::from_value(bad.clone()), Err(SpiderError::Settings(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn equal_settings_hash_equally() {
        let a = Settings::from_json_str(r#"{"a": 1, "b": {"c": true}}"#).unwrap();
        let b = Settings::from_toml_str("a = 1\n[b]\nc = true\n").unwrap();
        assert_eq!(a, b);
        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a, a.merged(json!({"b": {"d": 1}})).unwrap());
    }

    #[test]
    fn merge_leaves_the_original_untouched() {
        let base = Settings::from_value(json!({"fetcher": {"qps": 2, "max_qps": 4}})).unwrap();
        let merged = base.merged(json!({"fetcher": {"qps": 3}})).unwrap();
        assert_eq!(base.fetcher_qps(), 2);
        assert_eq!(merged.fetcher_qps(), 3);
        assert_eq!(merged.fetcher_max_qps(), 4);
    }

    #[test]
    fn loads_files_by_extension() {
        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json_file, r#"{{"spider": {{"concurrency": 4}}}}"#).unwrap();
        assert_eq!(Settings::from_file(json_file.path()).unwrap().concurrency(), 4);

        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(toml_file, "[fetcher]\nqps = 1\nmax_qps = 1\n").unwrap();
        assert_eq!(Settings::from_file(toml_file.path()).unwrap().fetcher_max_qps(), 1);

        let other = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(Settings::from_file(other.path()).is_err());
    }
}
