//! Module for tracking the lifecycle state of an actor.
//!
//! This module defines `ActorState` and `AtomicActorState`. The atomic cell is
//! written only by the actor's own thread and read from anywhere, which is how
//! the controller and cross-thread callers decide whether an actor is still
//! willing to accept work or has fully shut down.
//!
//! The state only moves forward:
//! `Initial -> Starting -> Running -> Stopping -> Stopped`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// The lifecycle state of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ActorState {
    /// Created, thread not started yet.
    Initial = 0,
    /// Thread started, start callbacks running.
    Starting = 1,
    /// Loop processing work.
    Running = 2,
    /// Stop accepted, pending work being drained.
    Stopping = 3,
    /// Loop and thread have exited.
    Stopped = 4,
}

impl ActorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ActorState::Initial,
            1 => ActorState::Starting,
            2 => ActorState::Running,
            3 => ActorState::Stopping,
            _ => ActorState::Stopped,
        }
    }

    /// Whether new work may still be submitted in this state.
    pub fn accepts_work(self) -> bool {
        self < ActorState::Stopping
    }
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActorState::Initial => "initial",
            ActorState::Starting => "starting",
            ActorState::Running => "running",
            ActorState::Stopping => "stopping",
            ActorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// An atomically readable, monotonic `ActorState` cell.
#[derive(Debug)]
pub struct AtomicActorState(AtomicU8);

impl Default for AtomicActorState {
    fn default() -> Self {
        Self(AtomicU8::new(ActorState::Initial as u8))
    }
}

impl AtomicActorState {
    pub fn load(&self) -> ActorState {
        ActorState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves the state forward to `next`. Returns the previous state, or
    /// `None` if `next` would not be a forward move.
    pub fn advance(&self, next: ActorState) -> Option<ActorState> {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < next as u8).then_some(next as u8)
            })
            .ok()
            .map(ActorState::from_u8)
    }

    /// Moves from exactly `from` to `to`.
    pub fn transition(&self, from: ActorState, to: ActorState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
