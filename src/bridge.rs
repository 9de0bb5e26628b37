//! Cross-actor scheduling.
//!
//! [`Actor::schedule`] hands a unit of work to another actor's loop and gives
//! the caller a [`Pending`] handle for its result. The handle can be awaited
//! from any async context (typically another actor's loop), blocked on from a
//! plain thread with [`Pending::wait`], or dropped for fire-and-forget.
//!
//! If the target actor drops the work (it stopped with the cancel policy, or
//! the work was still queued when the loop exited), the handle resolves to
//! [`SpiderError::Cancelled`].

use crate::actor::Actor;
use crate::error::{Result, SpiderError};
use futures_util::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

/// The eventual result of work scheduled on another actor.
#[must_use = "dropping a Pending discards the result; bind it to `_` for fire-and-forget"]
pub struct Pending<T> {
    actor: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Name of the actor the work runs on.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Blocks the current thread until the result is available.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<T> {
        let actor = self.actor;
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(SpiderError::Cancelled(actor)))
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match this.rx.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SpiderError::Cancelled(this.actor.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Actor {
    /// Schedules `work` on this actor's loop.
    ///
    /// `work` is sent to the actor thread and called there, so the future it
    /// builds may hold thread-local (`!Send`) state. Fails immediately if the
    /// actor is stopping or stopped.
    pub fn schedule<F, Fut, T>(&self, work: F) -> Result<Pending<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        trace!(actor = %self.name(), "scheduling work");
        self.submit(Box::new(move || {
            Box::pin(async move {
                let result = work().await;
                // The caller may have dropped its handle.
                let _ = tx.send(result);
            })
        }))?;
        Ok(Pending {
            actor: self.name().to_string(),
            rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorConfig;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn result_is_delivered_to_a_plain_thread() {
        let actor = Actor::new("bridge-plain");
        actor.start().unwrap();

        let pending = actor
            .schedule(|| async {
                // !Send state is fine on the target loop.
                let local = Rc::new(20);
                tokio::task::yield_now().await;
                Ok(*local + 1)
            })
            .unwrap();
        assert_eq!(pending.actor(), "bridge-plain");
        assert_eq!(pending.wait().unwrap(), 21);

        actor.stop().unwrap();
        actor.join().unwrap();
    }

    #[test]
    fn errors_travel_back_to_the_caller() {
        let actor = Actor::new("bridge-error");
        actor.start().unwrap();
        let err = actor
            .schedule(|| async { Err::<(), _>(SpiderError::Timeout("http://x/".into())) })
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(matches!(err, SpiderError::Timeout(_)));
        actor.stop().unwrap();
        actor.join().unwrap();
    }

    #[test]
    fn awaiting_across_actors() {
        let worker = Actor::new("bridge-worker");
        let caller = Actor::new("bridge-caller");
        worker.start().unwrap();
        caller.start().unwrap();

        let target = worker.clone();
        let pending = caller
            .schedule(move || async move {
                let mut sum = 0;
                for i in 0..5 {
                    sum += target.schedule(move || async move { Ok(i * 2) })?.await?;
                }
                Ok(sum)
            })
            .unwrap();
        assert_eq!(pending.wait().unwrap(), 20);

        for actor in [&caller, &worker] {
            actor.stop().unwrap();
            actor.join().unwrap();
        }
    }

    #[test]
    fn cancelled_work_resolves_as_cancelled() {
        let actor = Actor::new("bridge-cancel");
        actor.start().unwrap();
        let pending = actor
            .schedule(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        actor.stop().unwrap();
        let err = pending.wait().unwrap_err();
        assert!(matches!(err, SpiderError::Cancelled(ref name) if name == "bridge-cancel"));
        actor.join().unwrap();
        assert!(actor.schedule(|| async { Ok(()) }).is_err());
    }

    #[test]
    fn dropped_handles_are_fire_and_forget() {
        let actor = Actor::with_config(
            "bridge-forget",
            ActorConfig {
                drain_policy: crate::actor::DrainPolicy::Complete,
                parent_span: None,
            },
        );
        let ran = Arc::new(AtomicUsize::new(0));
        actor.start().unwrap();
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            let _ = actor.schedule(move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        actor.stop().unwrap();
        actor.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pending_can_be_awaited_from_a_foreign_runtime() {
        let actor = Actor::new("bridge-async");
        actor.start().unwrap();
        let value = actor
            .schedule(|| async { Ok(String::from("done")) })
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, "done");
        actor.stop().unwrap();
        actor.join().unwrap();
    }
}
