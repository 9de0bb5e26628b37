//! # Statistics Module
//!
//! Runtime metrics shared by every actor of one controller.
//!
//! ## Overview
//!
//! The `StatCollector` is updated concurrently by the fetcher, the saver and
//! every spider, each from its own thread. Counters are atomics; the status
//! histogram is a `DashMap`; the open-ended runtime data (`runtime`,
//! `item_count`, anything user processors record) sits behind a mutex.
//!
//! ## Key Metrics Tracked
//!
//! - **Requests**: sent, succeeded, failed, dropped by the request pipeline
//! - **Responses**: status code distribution, bytes downloaded
//! - **Items**: saved, dropped by the item pipeline, failed in a processor
//! - **Actions**: enqueued, completed, failed, unexpected yields
//!
//! ## Example
//!
//! ```rust,ignore
//! let stats = controller.stats();
//! println!("{}", stats.to_json_string_pretty()?);
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// A consistent copy of every metric, used by all export formats.
#[derive(Debug, Serialize)]
struct StatsSnapshot {
    requests_sent: usize,
    requests_succeeded: usize,
    requests_failed: usize,
    requests_dropped: usize,
    total_bytes_downloaded: usize,
    response_status_counts: BTreeMap<u16, usize>,
    items_saved: usize,
    items_dropped: usize,
    items_failed: usize,
    actions_enqueued: usize,
    actions_completed: usize,
    actions_failed: usize,
    unexpected_outputs: usize,
    #[serde(with = "duration_secs")]
    elapsed: Duration,
    runtime_data: BTreeMap<String, Value>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

impl StatsSnapshot {
    fn formatted_duration(&self) -> String {
        format!("{:?}", self.elapsed)
    }

    fn per_second(&self, count: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            count as f64 / secs
        } else {
            0.0
        }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        if self.total_bytes_downloaded >= GB {
            format!("{:.2} GB", self.total_bytes_downloaded as f64 / GB as f64)
        } else if self.total_bytes_downloaded >= MB {
            format!("{:.2} MB", self.total_bytes_downloaded as f64 / MB as f64)
        } else if self.total_bytes_downloaded >= KB {
            format!("{:.2} KB", self.total_bytes_downloaded as f64 / KB as f64)
        } else {
            format!("{} B", self.total_bytes_downloaded)
        }
    }

    fn status_list(&self, sep: &str, fmt: impl Fn(u16, usize) -> String) -> Option<String> {
        if self.response_status_counts.is_empty() {
            return None;
        }
        Some(
            self.response_status_counts
                .iter()
                .map(|(code, count)| fmt(*code, *count))
                .collect::<Vec<String>>()
                .join(sep),
        )
    }
}

/// Collects metrics about a controller's actors.
#[derive(Debug)]
pub struct StatCollector {
    start_time: Instant,

    requests_sent: AtomicUsize,
    requests_succeeded: AtomicUsize,
    requests_failed: AtomicUsize,
    requests_dropped: AtomicUsize,
    total_bytes_downloaded: AtomicUsize,
    response_status_counts: DashMap<u16, usize>,

    items_saved: AtomicUsize,
    items_dropped: AtomicUsize,
    items_failed: AtomicUsize,

    actions_enqueued: AtomicUsize,
    actions_completed: AtomicUsize,
    actions_failed: AtomicUsize,
    unexpected_outputs: AtomicUsize,

    runtime_data: Mutex<BTreeMap<String, Value>>,
}

impl StatCollector {
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_sent: AtomicUsize::new(0),
            requests_succeeded: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            total_bytes_downloaded: AtomicUsize::new(0),
            response_status_counts: DashMap::new(),
            items_saved: AtomicUsize::new(0),
            items_dropped: AtomicUsize::new(0),
            items_failed: AtomicUsize::new(0),
            actions_enqueued: AtomicUsize::new(0),
            actions_completed: AtomicUsize::new(0),
            actions_failed: AtomicUsize::new(0),
            unexpected_outputs: AtomicUsize::new(0),
            runtime_data: Mutex::new(BTreeMap::new()),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let response_status_counts = self
            .response_status_counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::SeqCst),
            requests_succeeded: self.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            requests_dropped: self.requests_dropped.load(Ordering::SeqCst),
            total_bytes_downloaded: self.total_bytes_downloaded.load(Ordering::SeqCst),
            response_status_counts,
            items_saved: self.items_saved.load(Ordering::SeqCst),
            items_dropped: self.items_dropped.load(Ordering::SeqCst),
            items_failed: self.items_failed.load(Ordering::SeqCst),
            actions_enqueued: self.actions_enqueued.load(Ordering::SeqCst),
            actions_completed: self.actions_completed.load(Ordering::SeqCst),
            actions_failed: self.actions_failed.load(Ordering::SeqCst),
            unexpected_outputs: self.unexpected_outputs.load(Ordering::SeqCst),
            elapsed: self.start_time.elapsed(),
            runtime_data: self.runtime_data.lock().clone(),
        }
    }

    pub(crate) fn increment_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_succeeded(&self) {
        self.requests_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Increments the count of requests dropped by a request processor.
    pub(crate) fn increment_requests_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response_status(&self, status_code: u16) {
        *self.response_status_counts.entry(status_code).or_insert(0) += 1;
    }

    pub(crate) fn add_bytes_downloaded(&self, bytes: usize) {
        self.total_bytes_downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_saved(&self) {
        self.items_saved.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_dropped(&self) {
        self.items_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_actions_enqueued(&self) {
        self.actions_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_actions_completed(&self) {
        self.actions_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_actions_failed(&self) {
        self.actions_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Increments the count of yields that were neither actions nor items.
    pub(crate) fn increment_unexpected_outputs(&self) {
        self.unexpected_outputs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent.load(Ordering::SeqCst)
    }

    pub fn requests_succeeded(&self) -> usize {
        self.requests_succeeded.load(Ordering::SeqCst)
    }

    pub fn requests_failed(&self) -> usize {
        self.requests_failed.load(Ordering::SeqCst)
    }

    pub fn requests_dropped(&self) -> usize {
        self.requests_dropped.load(Ordering::SeqCst)
    }

    pub fn status_count(&self, status_code: u16) -> usize {
        self.response_status_counts
            .get(&status_code)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn items_saved(&self) -> usize {
        self.items_saved.load(Ordering::SeqCst)
    }

    pub fn items_dropped(&self) -> usize {
        self.items_dropped.load(Ordering::SeqCst)
    }

    pub fn items_failed(&self) -> usize {
        self.items_failed.load(Ordering::SeqCst)
    }

    pub fn actions_enqueued(&self) -> usize {
        self.actions_enqueued.load(Ordering::SeqCst)
    }

    pub fn actions_completed(&self) -> usize {
        self.actions_completed.load(Ordering::SeqCst)
    }

    pub fn actions_failed(&self) -> usize {
        self.actions_failed.load(Ordering::SeqCst)
    }

    pub fn unexpected_outputs(&self) -> usize {
        self.unexpected_outputs.load(Ordering::SeqCst)
    }

    /// Stores a value in the runtime data mapping, replacing any previous one.
    pub fn set_runtime_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.runtime_data.lock().insert(key.into(), value.into());
    }

    pub fn runtime_data(&self, key: &str) -> Option<Value> {
        self.runtime_data.lock().get(key).cloned()
    }

    /// Adds `delta` to the integer stored under `key` (missing counts as 0)
    /// and returns the new value.
    pub fn increment_runtime_counter(&self, key: &str, delta: i64) -> i64 {
        let mut data = self.runtime_data.lock();
        let next = data.get(key).and_then(Value::as_i64).unwrap_or(0) + delta;
        data.insert(key.to_string(), Value::from(next));
        next
    }

    pub fn runtime_data_snapshot(&self) -> BTreeMap<String, Value> {
        self.runtime_data.lock().clone()
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Exports the current statistics to a Markdown formatted string.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.snapshot();

        let status_codes_output = snapshot
            .status_list("\n", |code, count| format!("- **{}**: {}", code, count))
            .unwrap_or_else(|| "N/A".to_string());
        let runtime_output = if snapshot.runtime_data.is_empty() {
            "N/A".to_string()
        } else {
            snapshot
                .runtime_data
                .iter()
                .map(|(k, v)| format!("- **{}**: {}", k, v))
                .collect::<Vec<String>>()
                .join("\n")
        };

        format!(
            r#"# Crawl Statistics Report

- **Duration**: {}
- **Average Speed**: {:.2} req/s, {:.2} item/s

## Requests
| Metric     | Count |
|------------|-------|
| Sent       | {}     |
| Succeeded  | {}     |
| Failed     | {}     |
| Dropped    | {}     |
| Downloaded | {}     |

## Items
| Metric     | Count |
|------------|-------|
| Saved      | {}     |
| Dropped    | {}     |
| Failed     | {}     |

## Actions
| Metric     | Count |
|------------|-------|
| Enqueued   | {}     |
| Completed  | {}     |
| Failed     | {}     |
| Unexpected | {}     |

## Status Codes
{}

## Runtime Data
{}
"#,
            snapshot.formatted_duration(),
            snapshot.per_second(snapshot.requests_sent),
            snapshot.per_second(snapshot.items_saved),
            snapshot.requests_sent,
            snapshot.requests_succeeded,
            snapshot.requests_failed,
            snapshot.requests_dropped,
            snapshot.formatted_bytes(),
            snapshot.items_saved,
            snapshot.items_dropped,
            snapshot.items_failed,
            snapshot.actions_enqueued,
            snapshot.actions_completed,
            snapshot.actions_failed,
            snapshot.unexpected_outputs,
            status_codes_output,
            runtime_output,
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {}", snapshot.formatted_duration())?;
        writeln!(
            f,
            "  requests : sent: {}, ok: {}, fail: {}, drop: {}, downloaded: {}",
            snapshot.requests_sent,
            snapshot.requests_succeeded,
            snapshot.requests_failed,
            snapshot.requests_dropped,
            snapshot.formatted_bytes()
        )?;
        writeln!(
            f,
            "  items    : saved: {}, dropped: {}, failed: {}",
            snapshot.items_saved, snapshot.items_dropped, snapshot.items_failed
        )?;
        writeln!(
            f,
            "  actions  : enqueued: {}, done: {}, failed: {}, unexpected: {}",
            snapshot.actions_enqueued,
            snapshot.actions_completed,
            snapshot.actions_failed,
            snapshot.unexpected_outputs
        )?;
        let status_string = snapshot
            .status_list(", ", |code, count| format!("{}: {}", code, count))
            .unwrap_or_else(|| "none".to_string());
        writeln!(f, "  status   : {}\n", status_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counters_and_exports() {
        let stats = StatCollector::new();
        stats.increment_requests_sent();
        stats.increment_requests_succeeded();
        stats.record_response_status(200);
        stats.record_response_status(200);
        stats.record_response_status(404);
        stats.add_bytes_downloaded(2048);
        stats.increment_items_saved();
        stats.increment_actions_enqueued();
        stats.set_runtime_data("runtime", 1.5);

        assert_eq!(stats.status_count(200), 2);
        assert_eq!(stats.status_count(500), 0);

        let json: Value = serde_json::from_str(&stats.to_json_string().unwrap()).unwrap();
        assert_eq!(json["requests_sent"], 1);
        assert_eq!(json["response_status_counts"]["404"], 1);
        assert_eq!(json["runtime_data"]["runtime"], json!(1.5));

        let markdown = stats.to_markdown_string();
        assert!(markdown.contains("| Sent       | 1     |"));
        assert!(markdown.contains("2.00 KB"));
        assert!(markdown.contains("- **runtime**: 1.5"));

        let text = stats.to_string();
        assert!(text.contains("200: 2, 404: 1"));
    }

    #[test]
    fn runtime_counters_accumulate() {
        let stats = StatCollector::new();
        assert_eq!(stats.increment_runtime_counter("item_count", 1), 1);
        assert_eq!(stats.increment_runtime_counter("item_count", 2), 3);
        assert_eq!(stats.runtime_data("item_count"), Some(json!(3)));
        assert_eq!(stats.runtime_data("missing"), None);
    }
}
