//! Core types and utilities for the pruned-network fine-tune harness.
//!
//! This crate holds what the data and training crates share: the error
//! type, run and pruning configuration, typed names for models, datasets and
//! learning rate policies, and the accuracy bookkeeping.

pub mod error;
pub mod types;
pub mod config;
pub mod metrics;
pub mod backend;
pub mod cli;

pub use error::{Error, Result};
pub use types::*;
pub use config::*;
pub use metrics::*;
pub use backend::*;
pub use cli::*;

pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::*;
    pub use crate::config::*;
    pub use crate::metrics::*;
    pub use crate::backend::*;
}
