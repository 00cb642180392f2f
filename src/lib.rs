//! Scriptless API test execution.
//!
//! A collection of request templates is run as a chain once per row of
//! test data. Row values and earlier responses are substituted into each
//! request before it is sent, and every attempt is logged.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod materialize;
pub mod model;
pub mod path;
pub mod placeholder;
pub mod postman;
pub mod runner;
pub mod store;

pub use config::*;
pub use dispatch::{Dispatcher, HttpDispatcher};
pub use error::{DispatchError, RowError};
pub use forward::ForwardingDispatcher;
pub use materialize::{MaterializeOptions, Materializer};
pub use model::*;
pub use runner::*;
pub use store::ResponseStore;

/// Crate version, shown by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
