//! Core configuration for stepflow.
//!
//! Resource names, the subscription address and tags live in an explicit
//! [`StackConfig`] that is handed to the workflow definition and trigger
//! binding at construction time.

pub mod config;
pub mod error;
pub mod resources;

pub use config::StackConfig;
pub use error::{CoreError, Result};
pub use resources::ResourceNames;
