//! # Builder Module
//!
//! Provides the `ControllerBuilder`, a fluent API for assembling a
//! [`Controller`] and its actors.
//!
//! ## Overview
//!
//! The builder collects the settings, the transport, the request and item
//! processors and the spiders, then wires them into one actor group:
//!
//! - **Fetcher**: gets the request processors, preceded by a
//!   [`TokenBucket`] sized from `fetcher.qps` / `fetcher.max_qps` unless
//!   `fetcher.rate_limit` is false
//! - **Saver**: gets the item processors; it completes pending work on stop
//!   when `saver.run_until_complete` is true (the default)
//! - **Spiders**: one actor each, with `spider.concurrency` workers
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_actor::prelude::*;
//!
//! fn crawl() -> Result<(), SpiderError> {
//!     let builder = ControllerBuilder::new("quotes")
//!         .settings(Settings::from_file("crawl.toml")?)
//!         .add_request_processor(DefaultHeaders::new().user_agent("quotes-bot/1.0"))
//!         .add_item_processor(LogItems)
//!         .add_spider(QuotesSpider::default());
//!     let counter = CountItems::new(builder.stats());
//!     let controller = builder.add_item_processor(counter).build()?;
//!     controller.run_all()
//! }
//! ```

use crate::actor::DrainPolicy;
use crate::crawler::{Controller, Fetcher, Saver};
use crate::error::{Result, SpiderError};
use crate::item::Item;
use crate::pipeline::Processor;
use crate::rate_limit::TokenBucket;
use crate::request::Request;
use crate::settings::Settings;
use crate::spider::{Spider, SpiderDeps, SpiderHandle};
use crate::stats::StatCollector;
use crate::transport::{ReqwestTransport, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info_span};

pub struct ControllerBuilder {
    name: String,
    settings: Settings,
    stats: Arc<StatCollector>,
    transport: Option<Arc<dyn Transport>>,
    request_processors: Vec<Arc<dyn Processor<Request>>>,
    item_processors: Vec<Arc<dyn Processor<Item>>>,
    spiders: Vec<Box<dyn Spider>>,
}

impl ControllerBuilder {
    /// Creates a builder for a controller named `name` with default settings
    /// and the reqwest transport.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Settings::default(),
            stats: Arc::new(StatCollector::new()),
            transport: None,
            request_processors: Vec::new(),
            item_processors: Vec::new(),
            spiders: Vec::new(),
        }
    }

    /// Sets the settings shared by every actor of the group.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets a custom transport for the fetcher.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Adds a processor to the end of the request pipeline.
    pub fn add_request_processor<P: Processor<Request>>(mut self, processor: P) -> Self {
        self.request_processors.push(Arc::new(processor));
        self
    }

    /// Adds a processor to the end of the item pipeline.
    pub fn add_item_processor<P: Processor<Item>>(mut self, processor: P) -> Self {
        self.item_processors.push(Arc::new(processor));
        self
    }

    pub fn add_spider<S: Spider>(mut self, spider: S) -> Self {
        self.spiders.push(Box::new(spider));
        self
    }

    /// The statistics the built controller will share with its actors.
    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    /// Builds the `Controller`. No actor is started.
    pub fn build(self) -> Result<Controller> {
        self.validate()?;
        let span = info_span!("controller", name = %self.name);
        let settings = self.settings;
        let stats = self.stats;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let fetcher = Fetcher::new(
            format!("{}.fetcher", self.name),
            transport,
            Arc::clone(&stats),
            Some(span.clone()),
        );
        if settings.rate_limit() {
            debug!(
                "Installing token bucket: qps={}, max_qps={}",
                settings.fetcher_qps(),
                settings.fetcher_max_qps()
            );
            fetcher
                .pipeline()
                .add_processor(TokenBucket::from_settings(&settings)?)?;
        }
        for processor in self.request_processors {
            fetcher.pipeline().add_shared(processor)?;
        }

        let drain_policy = if settings.saver_run_until_complete() {
            DrainPolicy::Complete
        } else {
            DrainPolicy::Cancel
        };
        let saver = Saver::new(
            format!("{}.saver", self.name),
            drain_policy,
            Arc::clone(&stats),
            Some(span.clone()),
        );
        for processor in self.item_processors {
            saver.pipeline().add_shared(processor)?;
        }

        let deps = SpiderDeps {
            fetcher: fetcher.clone(),
            saver: saver.clone(),
            settings: settings.clone(),
            stats: Arc::clone(&stats),
            parent_span: Some(span.clone()),
        };
        let spiders = self
            .spiders
            .into_iter()
            .map(|spider| SpiderHandle::new(spider, deps.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Controller::new(
            self.name, settings, stats, fetcher, saver, spiders, span,
        ))
    }

    fn validate(&self) -> Result<()> {
        if self.spiders.is_empty() {
            return Err(SpiderError::Settings(
                "Controller must have at least one spider.".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for spider in &self.spiders {
            if !names.insert(spider.name()) {
                return Err(SpiderError::Settings(format!(
                    "Duplicate spider name '{}'.",
                    spider.name()
                )));
            }
        }
        Ok(())
    }
}
