//! Domain model for the market research workflow engine.
//!
//! Sessions, stage state, the static stage registry and the error
//! taxonomy shared by the orchestrator, the worker pool and the HTTP layer.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
