//! # spider-actor
//!
//! An actor runtime for concurrent crawling.
//!
//! A crawl runs as a group of actors: one fetcher, one saver and any number
//! of spiders, each on a dedicated thread with its own single-threaded
//! scheduler. Spiders drive resumable [`Action`]s with a fixed worker pool;
//! actions fetch pages through the fetcher, emit items to the saver and spawn
//! further actions. A [`Controller`] starts the group from an ordinary thread
//! and waits until every spider has run out of work.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_actor::prelude::*;
//! use std::rc::Rc;
//!
//! struct Quotes;
//!
//! impl Spider for Quotes {
//!     fn name(&self) -> &str {
//!         "quotes"
//!     }
//!
//!     fn start_action(self: Rc<Self>, ctx: SpiderContext) -> Action {
//!         Action::new("start", move |co| async move {
//!             let schema = Schema::builder("Quote").field(Field::new("text")).build()?;
//!             if let Some(resp) = ctx.fetch(Request::get("https://quotes.example/")?).await? {
//!                 let mut quote = schema.item();
//!                 quote.set("text", resp.text_lossy())?;
//!                 co.emit(quote).await?;
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//!
//! fn main() -> Result<(), SpiderError> {
//!     spider_actor::logging::init();
//!     let controller = ControllerBuilder::new("quotes")
//!         .add_item_processor(LogItems)
//!         .add_spider(Quotes)
//!         .build()?;
//!     controller.run_all()
//! }
//! ```

pub mod action;
pub mod actor;
pub mod bridge;
pub mod builder;
pub mod crawler;
pub mod error;
pub mod item;
pub mod logging;
pub mod pipeline;
pub mod prelude;
pub mod processors;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod settings;
pub mod spider;
pub mod state;
pub mod stats;
pub mod transport;

pub use action::{Action, ActionId, Co, Output, Step};
pub use actor::{Actor, ActorConfig, DrainPolicy};
pub use bridge::Pending;
pub use builder::ControllerBuilder;
pub use crawler::{Controller, Fetcher, Saver};
pub use error::{Result, SpiderError};
pub use item::{Field, Item, Schema};
pub use pipeline::{Pipeline, Processor, ProcessorAction};
pub use rate_limit::TokenBucket;
pub use request::Request;
pub use response::Response;
pub use scheduler::ActionScheduler;
pub use settings::Settings;
pub use spider::{Spider, SpiderContext, SpiderHandle};
pub use state::ActorState;
pub use stats::StatCollector;
pub use transport::{ReqwestTransport, Transport};

pub use async_trait::async_trait;
pub use tokio;
