//! Built-in processors.
//!
//! - [`DefaultHeaders`]: fills in request headers the caller did not set
//! - [`LogItems`]: logs every item passing through the saver
//! - [`CountItems`]: counts items under `item_count` in the runtime data
//!
//! Rate limiting lives in [`crate::rate_limit`].

use crate::error::Result;
use crate::item::Item;
use crate::pipeline::{Processor, ProcessorAction};
use crate::request::Request;
use crate::stats::StatCollector;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Adds headers to requests that do not carry them already.
#[derive(Debug, Clone, Default)]
pub struct DefaultHeaders {
    headers: BTreeMap<String, String>,
}

impl DefaultHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn user_agent(self, agent: impl Into<String>) -> Self {
        self.header("User-Agent", agent)
    }
}

#[async_trait]
impl Processor<Request> for DefaultHeaders {
    fn name(&self) -> &str {
        "default_headers"
    }

    async fn process(&self, request: &mut Request) -> Result<ProcessorAction> {
        for (name, value) in &self.headers {
            if !request.has_header(name) {
                request.set_header(name.clone(), value.clone());
            }
        }
        Ok(ProcessorAction::Continue)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogItems;

#[async_trait]
impl Processor<Item> for LogItems {
    fn name(&self) -> &str {
        "log_items"
    }

    async fn process(&self, item: &mut Item) -> Result<ProcessorAction> {
        info!("{}", item);
        Ok(ProcessorAction::Continue)
    }
}

/// Increments the `item_count` runtime counter once per item.
#[derive(Debug, Clone)]
pub struct CountItems {
    stats: Arc<StatCollector>,
}

impl CountItems {
    pub const KEY: &'static str = "item_count";

    pub fn new(stats: Arc<StatCollector>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Processor<Item> for CountItems {
    fn name(&self) -> &str {
        "count_items"
    }

    fn on_start(&self) -> anyhow::Result<()> {
        if self.stats.runtime_data(Self::KEY).is_none() {
            self.stats.set_runtime_data(Self::KEY, 0);
        }
        Ok(())
    }

    async fn process(&self, _item: &mut Item) -> Result<ProcessorAction> {
        self.stats.increment_runtime_counter(Self::KEY, 1);
        Ok(ProcessorAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Field, Schema};
    use serde_json::json;

    #[tokio::test]
    async fn default_headers_do_not_override() {
        let headers = DefaultHeaders::new()
            .user_agent("spider-actor")
            .header("Accept", "text/html");
        let mut request = Request::get("http://example.com/")
            .unwrap()
            .with_header("accept", "application/json");

        let action = headers.process(&mut request).await.unwrap();
        assert_eq!(action, ProcessorAction::Continue);
        assert_eq!(request.header("user-agent"), Some("spider-actor"));
        assert_eq!(request.header("Accept"), Some("application/json"));
    }

    #[tokio::test]
    async fn items_are_counted() {
        let stats = Arc::new(StatCollector::new());
        let counter = CountItems::new(Arc::clone(&stats));
        counter.on_start().unwrap();
        assert_eq!(stats.runtime_data("item_count"), Some(json!(0)));

        let schema = Schema::builder("Quote")
            .field(Field::new("text"))
            .build()
            .unwrap();
        let mut item = schema.item();
        for _ in 0..3 {
            counter.process(&mut item).await.unwrap();
        }
        LogItems.process(&mut item).await.unwrap();
        assert_eq!(stats.runtime_data("item_count"), Some(json!(3)));
    }
}
