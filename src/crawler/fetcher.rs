//! The fetcher actor.
//!
//! Every request a spider issues crosses the bridge onto the fetcher's loop,
//! runs through the request pipeline (rate limiting included) and is handed
//! to the transport there. The outcome travels back to the awaiting action:
//!
//! - `Ok(Some(response))` for a completed exchange (any status code);
//! - `Ok(None)` when a request processor dropped the request;
//! - `Err(_)` for processor errors, timeouts and transport failures.

use crate::actor::{Actor, ActorConfig, DrainPolicy};
use crate::bridge::Pending;
use crate::error::Result;
use crate::pipeline::{Pipeline, ProcessorAction};
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatCollector;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn, Span};

#[derive(Clone)]
pub struct Fetcher {
    actor: Actor,
    pipeline: Arc<Pipeline<Request>>,
    transport: Arc<dyn Transport>,
    stats: Arc<StatCollector>,
}

impl Fetcher {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        stats: Arc<StatCollector>,
        parent_span: Option<Span>,
    ) -> Self {
        let actor = Actor::with_config(
            name,
            ActorConfig {
                drain_policy: DrainPolicy::Cancel,
                parent_span,
            },
        );
        Self {
            pipeline: Arc::new(Pipeline::new(actor.clone())),
            actor,
            transport,
            stats,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// The request pipeline. Editable until the fetcher starts.
    pub fn pipeline(&self) -> &Pipeline<Request> {
        &self.pipeline
    }

    pub fn start(&self) -> Result<()> {
        self.pipeline.activate()?;
        self.actor.start()
    }

    /// Schedules `request` on the fetcher's loop.
    pub fn fetch(&self, request: Request) -> Result<Pending<Option<Response>>> {
        let pipeline = Arc::clone(&self.pipeline);
        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);
        self.actor.schedule(move || async move {
            fetch_one(&pipeline, transport.as_ref(), &stats, request).await
        })
    }
}

async fn fetch_one(
    pipeline: &Pipeline<Request>,
    transport: &dyn Transport,
    stats: &StatCollector,
    mut request: Request,
) -> Result<Option<Response>> {
    trace!("Processing request through pipeline: {}", request.url);
    match pipeline.process(&mut request).await {
        Ok(ProcessorAction::Continue) => {}
        Ok(ProcessorAction::Drop) => {
            debug!("Request dropped by processor for URL: {}", request.url);
            stats.increment_requests_dropped();
            return Ok(None);
        }
        Err(e) => {
            warn!("Request processor error for URL {}: {}", request.url, e);
            stats.increment_requests_failed();
            return Err(e);
        }
    }

    let url = request.url.clone();
    stats.increment_requests_sent();
    let started = Instant::now();
    match transport.send(request).await {
        Ok(response) => {
            trace!(
                "Download successful for URL: {}, took {:?}",
                url,
                started.elapsed()
            );
            stats.increment_requests_succeeded();
            stats.record_response_status(response.status());
            stats.add_bytes_downloaded(response.content().len());
            Ok(Some(response))
        }
        Err(e) => {
            warn!("Download error for URL {}: {}", url, e);
            stats.increment_requests_failed();
            Err(e)
        }
    }
}
