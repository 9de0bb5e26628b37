//! # Spider Module
//!
//! Defines the `Spider` trait and the spider actor that drives its actions.
//!
//! ## Overview
//!
//! A spider is user logic that produces [`Action`]s. Each spider runs on its
//! own actor. When the actor starts, the spider's seed action (its
//! [`start_action`](Spider::start_action)) is enqueued and a fixed pool of
//! `spider.concurrency` workers begins pulling actions from the queue. A
//! worker drives one action to completion before taking the next one:
//!
//! - an emitted `Action` is enqueued on the same queue;
//! - an emitted `Item` is handed to the saver (fire-and-forget);
//! - `Nothing` is ignored;
//! - anything else is logged as unexpected.
//!
//! A failing or panicking action is logged with its identity and counted; it
//! never takes down its worker. When a worker finishes an action and leaves
//! the queue empty with no other worker busy, the spider stops itself
//! (unless `spider.stop_when_empty` is false).
//!
//! ## Example
//!
//! ```rust,ignore
//! struct Pages;
//!
//! impl Spider for Pages {
//!     fn name(&self) -> &str {
//!         "pages"
//!     }
//!
//!     fn start_action(self: Rc<Self>, ctx: SpiderContext) -> Action {
//!         Action::new("seed", move |co| async move {
//!             for n in 1..=3 {
//!                 let ctx = ctx.clone();
//!                 co.emit(Action::new(format!("page-{n}"), move |co| async move {
//!                     let url = format!("https://example.com/{n}");
//!                     if let Some(resp) = ctx.fetch(Request::get(&url)?).await? {
//!                         co.emit(page_item(&resp)?).await?;
//!                     }
//!                     Ok(())
//!                 }))
//!                 .await?;
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::action::{Action, Output, Step};
use crate::actor::{self, Actor, ActorConfig, DrainPolicy};
use crate::bridge::Pending;
use crate::crawler::{Fetcher, Saver};
use crate::error::{Result, SpiderError};
use crate::item::Item;
use crate::request::Request;
use crate::response::Response;
use crate::scheduler::ActionScheduler;
use crate::settings::Settings;
use crate::stats::StatCollector;
use futures_util::FutureExt;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, trace, warn, Span};

/// User crawl logic.
///
/// The spider value is moved onto its actor thread when the actor starts and
/// is only used there. State created by its actions may use `Rc`/`RefCell`.
pub trait Spider: Send + 'static {
    fn name(&self) -> &str;

    /// Builds the seed action of the crawl.
    fn start_action(self: Rc<Self>, ctx: SpiderContext) -> Action;
}

struct ContextInner {
    name: String,
    actor: Actor,
    scheduler: ActionScheduler,
    fetcher: Fetcher,
    saver: Saver,
    settings: Settings,
    stats: Arc<StatCollector>,
}

/// What actions use to reach the rest of the runtime. Only usable on the
/// spider's own thread.
#[derive(Clone)]
pub struct SpiderContext {
    inner: Rc<ContextInner>,
}

thread_local! {
    static CURRENT_SPIDER: RefCell<Option<SpiderContext>> = const { RefCell::new(None) };
}

impl SpiderContext {
    /// The context of the spider owning the current thread, if any.
    pub fn current() -> Option<SpiderContext> {
        CURRENT_SPIDER.with(|cell| cell.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn stats(&self) -> &Arc<StatCollector> {
        &self.inner.stats
    }

    pub fn actor(&self) -> &Actor {
        &self.inner.actor
    }

    /// Number of actions waiting in the queue.
    pub fn pending_actions(&self) -> usize {
        self.inner.scheduler.len()
    }

    /// Sends `request` through the fetcher. `Ok(None)` means a request
    /// processor dropped it.
    pub async fn fetch(&self, request: Request) -> Result<Option<Response>> {
        self.inner.fetcher.fetch(request)?.await
    }

    /// Hands `item` to the saver without waiting for the outcome.
    pub fn save(&self, item: Item) -> Result<()> {
        let _ = self.inner.saver.save(item)?;
        Ok(())
    }

    /// Hands `item` to the saver and waits until every processor has seen it.
    pub async fn save_and_wait(&self, item: Item) -> Result<bool> {
        self.inner.saver.save(item)?.await
    }

    /// Enqueues an action on this spider's queue.
    pub fn add_action(&self, action: Action) -> Result<()> {
        self.inner.scheduler.enqueue(action)?;
        self.inner.stats.increment_actions_enqueued();
        Ok(())
    }

    /// Closes the action queue and stops the spider actor.
    pub fn stop(&self) -> Result<()> {
        self.inner.scheduler.close();
        self.inner.actor.stop()
    }
}

/// The collaborators a spider actor is wired to.
#[derive(Clone)]
pub(crate) struct SpiderDeps {
    pub fetcher: Fetcher,
    pub saver: Saver,
    pub settings: Settings,
    pub stats: Arc<StatCollector>,
    pub parent_span: Option<Span>,
}

/// A cross-thread handle to a spider actor.
#[derive(Clone)]
pub struct SpiderHandle {
    name: String,
    actor: Actor,
}

impl SpiderHandle {
    pub(crate) fn new(spider: Box<dyn Spider>, deps: SpiderDeps) -> Result<Self> {
        let name = spider.name().to_string();
        let actor = Actor::with_config(
            name.clone(),
            ActorConfig {
                drain_policy: DrainPolicy::Cancel,
                parent_span: deps.parent_span.clone(),
            },
        );

        let own = actor.clone();
        let spider_name = name.clone();
        actor.call_on_start(move || {
            let ctx = SpiderContext {
                inner: Rc::new(ContextInner {
                    scheduler: ActionScheduler::new(spider_name.clone()),
                    name: spider_name,
                    actor: own,
                    fetcher: deps.fetcher,
                    saver: deps.saver,
                    settings: deps.settings,
                    stats: deps.stats,
                }),
            };
            CURRENT_SPIDER.with(|cell| *cell.borrow_mut() = Some(ctx.clone()));

            let seeded = panic::catch_unwind(AssertUnwindSafe(|| seed(&ctx, spider)))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("start action panicked")));
            if let Err(e) = seeded {
                error!("failed to seed spider: {:#}", e);
                ctx.inner.stats.increment_actions_failed();
                ctx.stop()?;
            }
            Ok(())
        })?;
        actor.call_on_stop(|| {
            if let Some(ctx) = CURRENT_SPIDER.with(|cell| cell.borrow_mut().take()) {
                ctx.inner.scheduler.close();
            }
            Ok(())
        })?;

        Ok(Self { name, actor })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn start(&self) -> Result<()> {
        self.actor.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.actor.stop()
    }

    pub fn join(&self) -> Result<()> {
        self.actor.join()
    }

    pub fn is_running(&self) -> bool {
        self.actor.is_running()
    }

    pub fn is_stopped(&self) -> bool {
        self.actor.is_stopped()
    }

    /// Builds an action on the spider's thread and enqueues it.
    pub fn inject<F>(&self, build: F) -> Result<Pending<()>>
    where
        F: FnOnce(&SpiderContext) -> Result<Action> + Send + 'static,
    {
        self.actor.schedule(move || async move {
            let ctx = SpiderContext::current().ok_or(SpiderError::NotInActor)?;
            let action = build(&ctx)?;
            ctx.add_action(action)
        })
    }
}

/// Enqueues the seed action and spawns the worker pool.
fn seed(ctx: &SpiderContext, spider: Box<dyn Spider>) -> anyhow::Result<()> {
    let spider: Rc<dyn Spider> = Rc::from(spider);
    ctx.add_action(spider.start_action(ctx.clone()))?;

    let workers = ctx.settings().concurrency();
    debug!("starting {} workers", workers);
    for index in 0..workers {
        actor::spawn_local(worker(ctx.clone(), index))?;
    }
    Ok(())
}

async fn worker(ctx: SpiderContext, index: usize) {
    trace!(worker = index, "worker started");
    while let Some(action) = ctx.inner.scheduler.next().await {
        let label = action.to_string();
        match AssertUnwindSafe(drive(&ctx, action)).catch_unwind().await {
            Ok(Ok(())) => {
                trace!(worker = index, "action {} completed", label);
                ctx.inner.stats.increment_actions_completed();
            }
            Ok(Err(e)) => {
                error!(worker = index, "action {} failed: {:#}", label, e);
                ctx.inner.stats.increment_actions_failed();
            }
            Err(_) => {
                error!(worker = index, "action {} panicked", label);
                ctx.inner.stats.increment_actions_failed();
            }
        }

        if ctx.inner.scheduler.finish() && ctx.settings().stop_when_empty() {
            debug!("action queue drained, stopping spider");
            if let Err(e) = ctx.stop() {
                warn!("failed to stop spider: {}", e);
            }
        }
    }
    trace!(worker = index, "worker finished");
}

async fn drive(ctx: &SpiderContext, mut action: Action) -> anyhow::Result<()> {
    let mut step = action.resume(None).await;
    loop {
        step = match step {
            Step::Done => return Ok(()),
            Step::Failed(e) => return Err(e),
            Step::Yielded(Output::Nothing) => action.resume(None).await,
            Step::Yielded(Output::Action(child)) => match ctx.add_action(child) {
                Ok(()) => action.resume(None).await,
                Err(e) => action.throw(e).await,
            },
            Step::Yielded(Output::Item(item)) => match ctx.save(item) {
                Ok(()) => action.resume(None).await,
                Err(e) => action.throw(e).await,
            },
            Step::Yielded(other) => {
                warn!("action {} yielded an unexpected {}", action, other.kind());
                ctx.inner.stats.increment_unexpected_outputs();
                action.resume(None).await
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct NoNetwork;

    #[async_trait]
    impl Transport for NoNetwork {
        async fn send(&self, request: Request) -> Result<Response> {
            Err(SpiderError::Transport(format!("no network for {}", request.url)))
        }
    }

    fn deps(settings: serde_json::Value) -> SpiderDeps {
        let stats = Arc::new(StatCollector::new());
        SpiderDeps {
            fetcher: Fetcher::new("fetcher", Arc::new(NoNetwork), Arc::clone(&stats), None),
            saver: Saver::new("saver", DrainPolicy::Cancel, Arc::clone(&stats), None),
            settings: Settings::from_value(settings).unwrap(),
            stats,
            parent_span: None,
        }
    }

    fn join_within(handle: &SpiderHandle, limit: Duration) {
        let deadline = Instant::now() + limit;
        while !handle.is_stopped() {
            assert!(Instant::now() < deadline, "spider did not stop in time");
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().unwrap();
    }

    /// Emits `children` actions that each hold a slot for a while.
    struct Fanout {
        children: usize,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
    }

    impl Spider for Fanout {
        fn name(&self) -> &str {
            "fanout"
        }

        fn start_action(self: Rc<Self>, _ctx: SpiderContext) -> Action {
            Action::new("seed", move |co| async move {
                for i in 0..self.children {
                    let this = Rc::clone(&self);
                    co.emit(Action::new(format!("child-{}", i), move |_co| async move {
                        let now = this.running.fetch_add(1, Ordering::SeqCst) + 1;
                        this.peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        this.running.fetch_sub(1, Ordering::SeqCst);
                        this.done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }))
                    .await?;
                }
                Ok(())
            })
        }
    }

    #[test]
    fn workers_never_exceed_the_configured_concurrency() {
        for concurrency in [1usize, 3] {
            let peak = Arc::new(AtomicUsize::new(0));
            let done = Arc::new(AtomicUsize::new(0));
            let deps = deps(json!({ "spider": { "concurrency": concurrency } }));
            let stats = Arc::clone(&deps.stats);
            let handle = SpiderHandle::new(
                Box::new(Fanout {
                    children: 12,
                    running: Arc::new(AtomicUsize::new(0)),
                    peak: Arc::clone(&peak),
                    done: Arc::clone(&done),
                }),
                deps,
            )
            .unwrap();
            handle.start().unwrap();
            join_within(&handle, Duration::from_secs(10));

            assert_eq!(done.load(Ordering::SeqCst), 12);
            assert!(peak.load(Ordering::SeqCst) <= concurrency);
            assert_eq!(stats.actions_completed(), 13);
        }
    }

    struct Faulty;

    impl Spider for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn start_action(self: Rc<Self>, _ctx: SpiderContext) -> Action {
            Action::new("seed", |co| async move {
                co.emit(Action::new("fails", |_| async {
                    Err(anyhow::anyhow!("broken page"))
                }))
                .await?;
                co.emit(Action::new("panics", |_| async {
                    if true {
                        panic!("bug");
                    }
                    Ok(())
                }))
                .await?;
                co.emit(json!({"not": "an item"})).await?;
                co.emit(()).await?;
                Ok(())
            })
        }
    }

    #[test]
    fn failing_actions_are_isolated() {
        let deps = deps(json!({ "concurrency": 2 }));
        let stats = Arc::clone(&deps.stats);
        let handle = SpiderHandle::new(Box::new(Faulty), deps).unwrap();
        handle.start().unwrap();
        join_within(&handle, Duration::from_secs(5));

        assert_eq!(stats.actions_enqueued(), 3);
        assert_eq!(stats.actions_completed(), 1);
        assert_eq!(stats.actions_failed(), 2);
        assert_eq!(stats.unexpected_outputs(), 1);
    }

    struct BadSeed;

    impl Spider for BadSeed {
        fn name(&self) -> &str {
            "bad-seed"
        }

        fn start_action(self: Rc<Self>, _ctx: SpiderContext) -> Action {
            panic!("bad seed")
        }
    }

    #[test]
    fn a_panicking_start_action_stops_the_spider() {
        let deps = deps(json!({}));
        let stats = Arc::clone(&deps.stats);
        let handle = SpiderHandle::new(Box::new(BadSeed), deps).unwrap();
        handle.start().unwrap();
        join_within(&handle, Duration::from_secs(5));

        assert_eq!(stats.actions_enqueued(), 0);
        assert_eq!(stats.actions_failed(), 1);
        assert!(handle.inject(|_| Ok(Action::new("late", |_| async { Ok(()) }))).is_err());
    }

    struct Idle;

    impl Spider for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn start_action(self: Rc<Self>, _ctx: SpiderContext) -> Action {
            Action::new("seed", |_| async { Ok(()) })
        }
    }

    #[test]
    fn injected_actions_run_when_the_spider_stays_alive() {
        let deps = deps(json!({ "spider": { "stop_when_empty": false } }));
        let stats = Arc::clone(&deps.stats);
        let handle = SpiderHandle::new(Box::new(Idle), deps).unwrap();
        handle.start().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        handle
            .inject(move |ctx| {
                assert_eq!(ctx.name(), "idle");
                Ok(Action::new("injected", move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            })
            .unwrap()
            .wait()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_running());
        handle.stop().unwrap();
        handle.join().unwrap();
        assert_eq!(stats.actions_completed(), 2);
    }

    struct Fetching;

    impl Spider for Fetching {
        fn name(&self) -> &str {
            "fetching"
        }

        fn start_action(self: Rc<Self>, ctx: SpiderContext) -> Action {
            Action::new("seed", move |_| async move {
                let err = ctx
                    .fetch(Request::get("http://unreachable/")?)
                    .await
                    .unwrap_err();
                anyhow::ensure!(matches!(err, SpiderError::Transport(_)), "unexpected {}", err);
                Ok(())
            })
        }
    }

    #[test]
    fn fetch_failures_surface_in_the_action() {
        let deps = deps(json!({}));
        let fetcher = deps.fetcher.clone();
        let stats = Arc::clone(&deps.stats);
        fetcher.start().unwrap();
        let handle = SpiderHandle::new(Box::new(Fetching), deps).unwrap();
        handle.start().unwrap();
        join_within(&handle, Duration::from_secs(5));
        assert_eq!(stats.actions_completed(), 1);
        assert_eq!(stats.requests_failed(), 1);
        fetcher.actor().stop().unwrap();
        fetcher.actor().join().unwrap();
    }
}
