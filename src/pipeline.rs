//! Ordered processor chains attached to the fetcher (requests) and the saver
//! (items).
//!
//! The chain may only be edited while its owning actor is still `initial`.
//! When the owner starts, every processor's `on_start` / `on_stop` hook is
//! registered as an actor callback so processor setup and teardown run on the
//! owner's thread at the matching lifecycle transition.

use crate::actor::Actor;
use crate::error::{Result, SpiderError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

/// What a processor wants done with the value it just saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorAction {
    /// Hand the (possibly mutated) value to the next processor.
    Continue,
    /// Discard the value; remaining processors are skipped.
    Drop,
}

/// A pluggable observer/mutator of requests or items.
#[async_trait]
pub trait Processor<T: Send>: Send + Sync + 'static {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    /// Runs on the owning actor's thread when it starts.
    fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs on the owning actor's thread after its pending work has drained.
    fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process(&self, value: &mut T) -> Result<ProcessorAction>;
}

pub struct Pipeline<T: Send + 'static> {
    owner: Actor,
    processors: RwLock<Vec<Arc<dyn Processor<T>>>>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new(owner: Actor) -> Self {
        Self {
            owner,
            processors: RwLock::new(Vec::new()),
        }
    }

    fn ensure_editable(&self) -> Result<()> {
        if !self.owner.is_initial() {
            return Err(SpiderError::invalid_state(
                self.owner.name(),
                format!("processors cannot be changed in state {}", self.owner.state()),
            ));
        }
        Ok(())
    }

    /// Appends a processor to the end of the chain.
    pub fn add_processor<P: Processor<T>>(&self, processor: P) -> Result<()> {
        self.insert(None, Arc::new(processor))
    }

    /// Puts a processor at the head of the chain.
    pub fn prepend_processor<P: Processor<T>>(&self, processor: P) -> Result<()> {
        self.insert(Some(0), Arc::new(processor))
    }

    pub fn add_shared(&self, processor: Arc<dyn Processor<T>>) -> Result<()> {
        self.insert(None, processor)
    }

    fn insert(&self, index: Option<usize>, processor: Arc<dyn Processor<T>>) -> Result<()> {
        self.ensure_editable()?;
        let mut processors = self.processors.write();
        if processors.iter().any(|p| p.name() == processor.name()) {
            return Err(SpiderError::DuplicateProcessor(processor.name().to_string()));
        }
        trace!(owner = %self.owner.name(), "adding processor '{}'", processor.name());
        match index {
            Some(index) => {
                let at = index.min(processors.len());
                processors.insert(at, processor)
            }
            None => processors.push(processor),
        }
        Ok(())
    }

    /// Removes the processor registered under `name`.
    pub fn remove_processor(&self, name: &str) -> Result<Arc<dyn Processor<T>>> {
        self.ensure_editable()?;
        let mut processors = self.processors.write();
        let index = processors
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| SpiderError::UnknownProcessor(name.to_string()))?;
        Ok(processors.remove(index))
    }

    pub fn processor_names(&self) -> Vec<String> {
        self.processors
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.read().is_empty()
    }

    /// Registers every processor's hooks as callbacks of the owning actor.
    /// Called once, right before the owner starts.
    pub(crate) fn activate(&self) -> Result<()> {
        for processor in self.processors.read().iter() {
            let on_start = Arc::clone(processor);
            self.owner.call_on_start(move || on_start.on_start())?;
            let on_stop = Arc::clone(processor);
            self.owner.call_on_stop(move || on_stop.on_stop())?;
        }
        Ok(())
    }

    /// Runs `value` through the chain in order.
    pub async fn process(&self, value: &mut T) -> Result<ProcessorAction> {
        let processors = self.processors.read().clone();
        for processor in processors {
            if processor.process(value).await? == ProcessorAction::Drop {
                debug!(owner = %self.owner.name(), "dropped by processor '{}'", processor.name());
                return Ok(ProcessorAction::Drop);
            }
        }
        Ok(ProcessorAction::Continue)
    }
}
