//! The top-level orchestrator of an actor group.
//!
//! A `Controller` binds one [`Fetcher`], one [`Saver`] and any number of
//! spiders into a named group sharing one [`Settings`] instance and one
//! [`StatCollector`]. It runs on an ordinary thread with no event loop of its
//! own, so it observes actor state from the outside: `wait_all` sleeps for
//! `controller.poll_interval_ms` between checks and drains callbacks queued
//! with [`Controller::call`] on every tick.
//!
//! Shutdown is sequenced: spiders first, then the fetcher and saver (so that
//! work the spiders handed over can still be served), then the threads are
//! joined and the controller's stop callbacks run.

use crate::actor::{Actor, CallbackQueue};
use crate::crawler::{Fetcher, Saver};
use crate::error::{Result, SpiderError};
use crate::settings::Settings;
use crate::spider::SpiderHandle;
use crate::stats::StatCollector;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn, Span};

const IDLE: u8 = 0;
const STARTED: u8 = 1;
const FINISHED: u8 = 2;

/// The orchestrator of one fetcher, one saver and a set of spiders.
pub struct Controller {
    name: String,
    settings: Settings,
    stats: Arc<StatCollector>,
    fetcher: Fetcher,
    saver: Saver,
    spiders: Vec<SpiderHandle>,
    on_start: CallbackQueue,
    on_stop: CallbackQueue,
    runtime: CallbackQueue,
    phase: AtomicU8,
    span: Span,
}

impl Controller {
    pub(crate) fn new(
        name: String,
        settings: Settings,
        stats: Arc<StatCollector>,
        fetcher: Fetcher,
        saver: Saver,
        spiders: Vec<SpiderHandle>,
        span: Span,
    ) -> Self {
        let controller = Self {
            name,
            settings,
            stats,
            fetcher,
            saver,
            spiders,
            on_start: CallbackQueue::default(),
            on_stop: CallbackQueue::default(),
            runtime: CallbackQueue::default(),
            phase: AtomicU8::new(IDLE),
            span,
        };
        controller.measure_runtime();
        controller
    }

    /// Records the wall-clock duration of the run under `runtime` (seconds).
    fn measure_runtime(&self) {
        let started = Arc::new(Mutex::new(None));
        let mark = Arc::clone(&started);
        self.on_start.push(Box::new(move || {
            *mark.lock() = Some(Instant::now());
            Ok(())
        }));
        let stats = Arc::clone(&self.stats);
        self.on_stop.push(Box::new(move || {
            if let Some(at) = started.lock().take() {
                stats.set_runtime_data("runtime", json!(at.elapsed().as_secs_f64()));
            }
            Ok(())
        }));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The statistics shared by every actor of the group.
    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn saver(&self) -> &Saver {
        &self.saver
    }

    pub fn spiders(&self) -> &[SpiderHandle] {
        &self.spiders
    }

    pub fn spider(&self, name: &str) -> Option<&SpiderHandle> {
        self.spiders.iter().find(|s| s.name() == name)
    }

    /// Whether `start_all` ran and `wait_all` has not finished yet.
    pub fn is_running(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == STARTED
    }

    /// Registers a callback run on the controller thread before any actor
    /// starts.
    pub fn call_on_start<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.phase.load(Ordering::SeqCst) != IDLE {
            return Err(SpiderError::invalid_state(
                &self.name,
                "start callbacks cannot be added once the controller has started",
            ));
        }
        self.on_start.push(Box::new(callback));
        Ok(())
    }

    /// Registers a callback run on the controller thread after every actor
    /// has stopped.
    pub fn call_on_stop<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.phase.load(Ordering::SeqCst) == FINISHED {
            return Err(SpiderError::invalid_state(
                &self.name,
                "stop callbacks cannot be added once the controller has finished",
            ));
        }
        self.on_stop.push(Box::new(callback));
        Ok(())
    }

    /// Queues a callback for the controller thread's next poll tick. Safe to
    /// call from any thread, including actor threads.
    pub fn call<F>(&self, callback: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.runtime.push(Box::new(callback));
    }

    /// Starts every actor and blocks until the whole group has wound down.
    pub fn run_all(&self) -> Result<()> {
        self.start_all()?;
        self.wait_all()
    }

    /// Runs the start callbacks, then starts the fetcher, the saver and
    /// every spider, in that order. A failed start stops whatever did start
    /// and leaves the controller finished.
    pub fn start_all(&self) -> Result<()> {
        let _entered = self.span.enter();
        if self
            .phase
            .compare_exchange(IDLE, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SpiderError::invalid_state(&self.name, "controller already started"));
        }

        info!(
            "Controller starting with {} spider(s): concurrency={}, qps={}, max_qps={}",
            self.spiders.len(),
            self.settings.concurrency(),
            self.settings.fetcher_qps(),
            self.settings.fetcher_max_qps()
        );
        self.on_start.run_all(&self.name, "start");

        let started = self
            .fetcher
            .start()
            .and_then(|_| self.saver.start())
            .and_then(|_| self.spiders.iter().try_for_each(SpiderHandle::start));
        if let Err(e) = started {
            warn!("Failed to start actor group: {}", e);
            self.stop_all();
            self.phase.store(FINISHED, Ordering::SeqCst);
            return Err(e);
        }
        debug!("All actors started");
        Ok(())
    }

    /// Requests every actor of the group to stop. Actors that never started
    /// are skipped.
    pub fn stop_all(&self) {
        debug!(controller = %self.name, "stopping all actors");
        for spider in &self.spiders {
            stop_quietly(spider.actor());
        }
        stop_quietly(self.fetcher.actor());
        stop_quietly(self.saver.actor());
    }

    /// Blocks until every spider has stopped, then stops the fetcher and the
    /// saver, joins all actor threads and runs the stop callbacks.
    pub fn wait_all(&self) -> Result<()> {
        let _entered = self.span.enter();
        if self.phase.load(Ordering::SeqCst) != STARTED {
            return Err(SpiderError::invalid_state(&self.name, "controller is not running"));
        }

        self.poll_until(|| self.spiders.iter().all(|s| s.is_stopped()));
        debug!("All spiders stopped, stopping fetcher and saver");
        stop_quietly(self.fetcher.actor());
        stop_quietly(self.saver.actor());
        self.poll_until(|| self.fetcher.actor().is_stopped() && self.saver.actor().is_stopped());

        for actor in self
            .spiders
            .iter()
            .map(SpiderHandle::actor)
            .chain([self.fetcher.actor(), self.saver.actor()])
        {
            if let Err(e) = actor.join() {
                warn!("Failed to join actor '{}': {}", actor.name(), e);
            }
        }
        self.runtime.run_all(&self.name, "runtime");
        self.on_stop.run_all(&self.name, "stop");
        self.phase.store(FINISHED, Ordering::SeqCst);

        info!(
            "Controller finished. Stats: requests_sent={}, requests_succeeded={}, items_saved={}, actions_completed={}",
            self.stats.requests_sent(),
            self.stats.requests_succeeded(),
            self.stats.items_saved(),
            self.stats.actions_completed()
        );
        Ok(())
    }

    fn poll_until(&self, mut done: impl FnMut() -> bool) {
        let interval = self.settings.poll_interval();
        loop {
            self.runtime.run_all(&self.name, "runtime");
            if done() {
                return;
            }
            thread::sleep(interval);
        }
    }
}

fn stop_quietly(actor: &Actor) {
    if actor.is_initial() {
        return;
    }
    if let Err(e) = actor.stop() {
        warn!("Failed to stop actor '{}': {}", actor.name(), e);
    }
}
