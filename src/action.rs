//! # Action Module
//!
//! Resumable units of crawl work.
//!
//! ## Overview
//!
//! An [`Action`] wraps an async body that receives a [`Co`] handle. The body
//! hands values out to whoever drives it by awaiting [`Co::emit`]: nested
//! actions, items, or anything else. The driver sees each emitted value as
//! [`Step::Yielded`] and decides how to continue:
//!
//! - [`Action::resume`] wakes the body, and `emit` returns the sent value;
//! - [`Action::throw`] wakes the body, and `emit` returns the injected error;
//! - [`Action::close`] drops the body where it stands.
//!
//! Between yields the body is free to await real futures (fetches, saves);
//! the driver simply keeps polling it until it emits or finishes.
//!
//! ## Example
//!
//! ```rust,ignore
//! let action = Action::new("list", move |co| async move {
//!     for page in 1..=3 {
//!         co.emit(Action::new(format!("page-{page}"), |_| async { Ok(()) })).await?;
//!     }
//!     Ok(())
//! });
//! ```

use crate::error::SpiderError;
use crate::item::Item;
use crate::response::Response;
use futures_util::future::{poll_fn, LocalBoxFuture};
use serde_json::Value;
use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an action, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(u64);

impl ActionId {
    fn next() -> Self {
        ActionId(NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value emitted by an action.
pub enum Output {
    /// Nothing to do; the driver just resumes.
    Nothing,
    /// More work for the same scheduler.
    Action(Action),
    /// A result for the saver.
    Item(Item),
    Response(Box<Response>),
    Value(Value),
}

impl Output {
    pub fn kind(&self) -> &'static str {
        match self {
            Output::Nothing => "nothing",
            Output::Action(_) => "action",
            Output::Item(_) => "item",
            Output::Response(_) => "response",
            Output::Value(_) => "value",
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Nothing => f.write_str("Nothing"),
            Output::Action(a) => f.debug_tuple("Action").field(a).finish(),
            Output::Item(i) => f.debug_tuple("Item").field(i).finish(),
            Output::Response(r) => f.debug_tuple("Response").field(&r.url().as_str()).finish(),
            Output::Value(v) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}

impl From<()> for Output {
    fn from(_: ()) -> Self {
        Output::Nothing
    }
}

impl From<Action> for Output {
    fn from(action: Action) -> Self {
        Output::Action(action)
    }
}

impl From<Item> for Output {
    fn from(item: Item) -> Self {
        Output::Item(item)
    }
}

impl From<Response> for Output {
    fn from(response: Response) -> Self {
        Output::Response(Box::new(response))
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Value(value)
    }
}

/// What the driver hands back into a suspended body.
type Sent = Result<Option<Value>, SpiderError>;

#[derive(Default)]
struct Channel {
    yielded: Option<Output>,
    sent: Option<Sent>,
}

/// The body's side of an action.
#[derive(Clone)]
pub struct Co {
    chan: Rc<RefCell<Channel>>,
}

impl Co {
    /// Suspends the body and hands `output` to the driver. Resolves to the
    /// value passed to [`Action::resume`], or to the error passed to
    /// [`Action::throw`].
    pub fn emit(&self, output: impl Into<Output>) -> Emit {
        Emit {
            chan: Rc::clone(&self.chan),
            output: Some(output.into()),
        }
    }
}

/// Future returned by [`Co::emit`].
#[must_use = "nothing is emitted unless the future is awaited"]
pub struct Emit {
    chan: Rc<RefCell<Channel>>,
    output: Option<Output>,
}

impl Future for Emit {
    type Output = Sent;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Sent> {
        if let Some(output) = self.output.take() {
            let mut chan = self.chan.borrow_mut();
            chan.sent = None;
            chan.yielded = Some(output);
            // The driver polls again after resume/throw; no waker needed.
            return Poll::Pending;
        }
        match self.chan.borrow_mut().sent.take() {
            Some(sent) => Poll::Ready(sent),
            None => Poll::Pending,
        }
    }
}

/// Result of advancing an action by one step.
#[derive(Debug)]
pub enum Step {
    Yielded(Output),
    Done,
    Failed(anyhow::Error),
}

enum Progress {
    Finished(anyhow::Result<()>),
    Yielded(Output),
}

/// A named, resumable unit of work.
pub struct Action {
    id: ActionId,
    name: Cow<'static, str>,
    body: Option<LocalBoxFuture<'static, anyhow::Result<()>>>,
    chan: Rc<RefCell<Channel>>,
    started: bool,
}

impl Action {
    /// Creates an action from a body. The body does not run until the first
    /// [`resume`](Self::resume).
    pub fn new<N, F, Fut>(name: N, body: F) -> Self
    where
        N: Into<Cow<'static, str>>,
        F: FnOnce(Co) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let chan = Rc::new(RefCell::new(Channel::default()));
        let co = Co {
            chan: Rc::clone(&chan),
        };
        Self {
            id: ActionId::next(),
            name: name.into(),
            body: Some(Box::pin(body(co))),
            chan,
            started: false,
        }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the body has finished, failed or been closed.
    pub fn is_done(&self) -> bool {
        self.body.is_none()
    }

    /// Runs the body until it emits or finishes. `value` is what the pending
    /// `emit` resolves to; it is ignored on the first call.
    pub async fn resume(&mut self, value: Option<Value>) -> Step {
        self.send(Ok(value)).await
    }

    /// Makes the pending `emit` resolve to `error`. An action that has not
    /// started yet fails immediately without running its body.
    pub async fn throw(&mut self, error: SpiderError) -> Step {
        if !self.started {
            self.body = None;
            return Step::Failed(error.into());
        }
        self.send(Err(error)).await
    }

    /// Drops the body, cancelling whatever it was waiting on.
    pub fn close(&mut self) {
        self.body = None;
        let mut chan = self.chan.borrow_mut();
        chan.yielded = None;
        chan.sent = None;
    }

    async fn send(&mut self, sent: Sent) -> Step {
        if self.body.is_none() {
            return Step::Done;
        }
        if self.started {
            self.chan.borrow_mut().sent = Some(sent);
        } else {
            self.started = true;
        }
        self.advance().await
    }

    async fn advance(&mut self) -> Step {
        let Some(body) = self.body.as_mut() else {
            return Step::Done;
        };
        let chan = Rc::clone(&self.chan);
        let progress = poll_fn(|cx| match body.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(Progress::Finished(result)),
            Poll::Pending => match chan.borrow_mut().yielded.take() {
                Some(output) => Poll::Ready(Progress::Yielded(output)),
                None => Poll::Pending,
            },
        })
        .await;

        match progress {
            Progress::Yielded(output) => Step::Yielded(output),
            Progress::Finished(result) => {
                self.body = None;
                match result {
                    Ok(()) => Step::Done,
                    Err(e) => Step::Failed(e),
                }
            }
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("done", &self.is_done())
            .finish()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::time::Duration;

    fn expect_value(step: Step) -> Value {
        match step {
            Step::Yielded(Output::Value(v)) => v,
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn yields_values_and_receives_resumes() {
        let mut action = Action::new("echo", |co| async move {
            let answer = co.emit(json!("question")).await?;
            co.emit(answer.unwrap_or(Value::Null)).await?;
            co.emit(()).await?;
            Ok(())
        });

        assert_eq!(expect_value(action.resume(None).await), json!("question"));
        assert_eq!(expect_value(action.resume(Some(json!(42))).await), json!(42));
        assert!(matches!(action.resume(None).await, Step::Yielded(Output::Nothing)));
        assert!(matches!(action.resume(None).await, Step::Done));
        assert!(action.is_done());
        assert!(matches!(action.resume(None).await, Step::Done));
    }

    #[tokio::test]
    async fn thrown_errors_surface_at_the_emit_point() {
        let mut action = Action::new("recover", |co| async move {
            match co.emit(json!(1)).await {
                Err(e) => co.emit(json!(format!("caught: {}", e))).await?,
                Ok(_) => None,
            };
            Ok(())
        });
        expect_value(action.resume(None).await);
        let step = action
            .throw(SpiderError::Timeout("http://example.com/".into()))
            .await;
        assert_eq!(
            expect_value(step),
            json!("caught: request to http://example.com/ timed out")
        );
        assert!(matches!(action.resume(None).await, Step::Done));

        let mut action = Action::new("propagate", |co| async move {
            co.emit(json!(1)).await?;
            Ok(())
        });
        expect_value(action.resume(None).await);
        let step = action.throw(SpiderError::GeneralError("boom".into())).await;
        assert!(matches!(step, Step::Failed(ref e) if e.to_string() == "boom"));
    }

    #[tokio::test]
    async fn throw_before_start_fails_without_running_the_body() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let mut action = Action::new("never", move |_co| async move {
            flag.set(true);
            Ok(())
        });
        let step = action.throw(SpiderError::GeneralError("early".into())).await;
        assert!(matches!(step, Step::Failed(_)));
        assert!(!ran.get());
        assert!(action.is_done());
    }

    #[tokio::test]
    async fn close_drops_the_body() {
        struct Guard(Rc<Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let guard = Guard(Rc::clone(&dropped));
        let mut action = Action::new("closable", move |co| async move {
            let _guard = guard;
            loop {
                co.emit(()).await?;
            }
        });
        assert!(matches!(action.resume(None).await, Step::Yielded(Output::Nothing)));
        action.close();
        assert!(dropped.get());
        assert!(matches!(action.resume(None).await, Step::Done));
    }

    #[tokio::test]
    async fn bodies_can_await_real_futures_between_yields() {
        let mut action = Action::new("sleepy", |co| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            co.emit(Action::new("child", |_| async { Ok(()) })).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(anyhow::anyhow!("failed after sleeping"))
        });
        match action.resume(None).await {
            Step::Yielded(Output::Action(child)) => assert_eq!(child.name(), "child"),
            other => panic!("unexpected step {:?}", other),
        }
        assert!(matches!(action.resume(None).await, Step::Failed(_)));
    }

    #[test]
    fn identities_are_unique_and_displayed() {
        let a = Action::new("a", |_| async { Ok(()) });
        let b = Action::new(String::from("b"), |_| async { Ok(()) });
        assert_ne!(a.id(), b.id());
        assert_eq!(a.to_string(), format!("a#{}", a.id()));
        assert_eq!(Output::from(b).kind(), "action");
    }
}
