//! The saver actor.
//!
//! Items emitted by actions cross the bridge onto the saver's loop and run
//! through the item pipeline there. Processor failures are logged and counted
//! but never reported back to the action that emitted the item.

use crate::actor::{Actor, ActorConfig, DrainPolicy};
use crate::bridge::Pending;
use crate::error::Result;
use crate::item::Item;
use crate::pipeline::{Pipeline, ProcessorAction};
use crate::stats::StatCollector;
use std::sync::Arc;
use tracing::{debug, error, trace, Span};

#[derive(Clone)]
pub struct Saver {
    actor: Actor,
    pipeline: Arc<Pipeline<Item>>,
    stats: Arc<StatCollector>,
}

impl Saver {
    /// With [`DrainPolicy::Complete`] every item already handed to the saver
    /// is processed before it stops.
    pub fn new(
        name: impl Into<String>,
        drain_policy: DrainPolicy,
        stats: Arc<StatCollector>,
        parent_span: Option<Span>,
    ) -> Self {
        let actor = Actor::with_config(
            name,
            ActorConfig {
                drain_policy,
                parent_span,
            },
        );
        Self {
            pipeline: Arc::new(Pipeline::new(actor.clone())),
            actor,
            stats,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// The item pipeline. Editable until the saver starts.
    pub fn pipeline(&self) -> &Pipeline<Item> {
        &self.pipeline
    }

    pub fn start(&self) -> Result<()> {
        self.pipeline.activate()?;
        self.actor.start()
    }

    /// Schedules `item` on the saver's loop. Resolves to `true` once every
    /// processor accepted it, `false` if one dropped it or failed.
    pub fn save(&self, item: Item) -> Result<Pending<bool>> {
        let pipeline = Arc::clone(&self.pipeline);
        let stats = Arc::clone(&self.stats);
        self.actor
            .schedule(move || async move { Ok(save_one(&pipeline, &stats, item).await) })
    }
}

async fn save_one(pipeline: &Pipeline<Item>, stats: &StatCollector, mut item: Item) -> bool {
    trace!("Processing item through {} processors", pipeline.len());
    match pipeline.process(&mut item).await {
        Ok(ProcessorAction::Continue) => {
            stats.increment_items_saved();
            true
        }
        Ok(ProcessorAction::Drop) => {
            debug!("Item {} dropped by processor", item.name());
            stats.increment_items_dropped();
            false
        }
        Err(e) => {
            error!("Item processor error for {}: {}", item, e);
            stats.increment_items_failed();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpiderError;
    use crate::item::{Field, Schema};
    use crate::pipeline::Processor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Collect(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Processor<Item> for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn process(&self, item: &mut Item) -> Result<ProcessorAction> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            match item.get("title")?.as_str() {
                Some("bad") => Err(SpiderError::GeneralError("rejected".into())),
                Some("skip") => Ok(ProcessorAction::Drop),
                Some(title) => {
                    self.0.lock().push(title.to_string());
                    Ok(ProcessorAction::Continue)
                }
                None => Ok(ProcessorAction::Drop),
            }
        }
    }

    fn item(title: &str) -> Item {
        let schema = Schema::builder("Page")
            .field(Field::new("title"))
            .build()
            .unwrap();
        Item::from_pairs(&schema, [("title", title)]).unwrap()
    }

    #[test]
    fn outcomes_are_counted_not_raised() {
        let stats = Arc::new(StatCollector::new());
        let saved = Arc::new(Mutex::new(Vec::new()));
        let saver = Saver::new("saver", DrainPolicy::Cancel, Arc::clone(&stats), None);
        saver.pipeline().add_processor(Collect(Arc::clone(&saved))).unwrap();
        saver.start().unwrap();

        assert!(saver.save(item("a")).unwrap().wait().unwrap());
        assert!(!saver.save(item("skip")).unwrap().wait().unwrap());
        assert!(!saver.save(item("bad")).unwrap().wait().unwrap());

        assert_eq!(*saved.lock(), vec!["a"]);
        assert_eq!(stats.items_saved(), 1);
        assert_eq!(stats.items_dropped(), 1);
        assert_eq!(stats.items_failed(), 1);

        saver.actor().stop().unwrap();
        saver.actor().join().unwrap();
    }

    #[test]
    fn complete_policy_saves_everything_handed_over() {
        let stats = Arc::new(StatCollector::new());
        let saved = Arc::new(Mutex::new(Vec::new()));
        let saver = Saver::new("saver", DrainPolicy::Complete, Arc::clone(&stats), None);
        saver.pipeline().add_processor(Collect(Arc::clone(&saved))).unwrap();
        saver.start().unwrap();

        for i in 0..5 {
            let _ = saver.save(item(&format!("item-{}", i))).unwrap();
        }
        saver.actor().stop().unwrap();
        saver.actor().join().unwrap();
        assert_eq!(saved.lock().len(), 5);
        assert_eq!(stats.items_saved(), 5);
    }
}
