//! A "prelude" for users of the `spider-actor` crate.
//!
//! This prelude re-exports the most commonly used traits, structs, and macros
//! so that they can be easily imported.
//!
//! # Example
//!
//! ```
//! use spider_actor::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Action,
    Co,
    Controller,
    ControllerBuilder,
    Field,
    Item,
    Output,
    Request,
    Response,
    Schema,
    Settings,
    SpiderContext,
    // Core traits
    Processor,
    ProcessorAction,
    Spider,
    Transport,
    // Essential re-exports for trait implementation
    async_trait,
};

pub use crate::error::{Result, SpiderError};
pub use crate::processors::{CountItems, DefaultHeaders, LogItems};
