//! # Crawler Module
//!
//! The actors of a crawl and the controller that orchestrates them.
//!
//! ## Overview
//!
//! A crawl runs as a group of actors, each on its own thread with its own
//! single-threaded scheduler:
//!
//! - **Fetcher**: runs every request through the request pipeline (rate
//!   limiting included) and hands it to the [`Transport`](crate::transport::Transport)
//! - **Saver**: runs every item through the item pipeline
//! - **Spiders**: drive actions with a fixed pool of workers (see
//!   [`crate::spider`])
//!
//! ## Architecture
//!
//! Spiders reach the fetcher and saver only through the bridge
//! ([`Actor::schedule`](crate::actor::Actor::schedule)); results travel back
//! as [`Pending`](crate::bridge::Pending) handles awaited on the spider's own
//! loop. The [`Controller`] is not an actor: it starts the group from an
//! ordinary thread and polls actor state to sequence the shutdown.

mod controller;
mod fetcher;
mod saver;

pub use controller::Controller;
pub use fetcher::Fetcher;
pub use saver::Saver;
