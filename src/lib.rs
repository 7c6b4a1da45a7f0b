//! Test-case execution engine.
//!
//! Cases are loaded from YAML into a [`CaseLibrary`], resolved (quoted
//! cases inlined, repeats and parameter records expanded) and run step
//! by step against an [`backend::ActionBackend`] by the [`Engine`].
//! Every step resolves `$var`/`${func(...)}` tokens against a layered
//! variable scope, dispatches its action, extracts values into the
//! session and checks its validators with the comparator table.

pub mod api_client;
pub mod assertion;
pub mod backend;
pub mod case;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod expression;
pub mod functions;
pub mod model;
pub mod report;
pub mod resolver;
pub mod scope;
pub mod skip;
pub mod step;

pub use config::*;
pub use coordinator::Engine;
pub use error::{EngineError, ErrorKind};
pub use functions::FunctionRegistry;
pub use model::*;
pub use report::{ChannelSink, ResultSink, RunSummary, StepEvent, SummaryBuilder};
pub use resolver::Resolver;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
