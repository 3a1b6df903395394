//! Command-line surface for the Parley pipeline: flags, tracing bootstrap and
//! the batch runner behind the `parley` binary.

pub mod bootstrap_helpers;
pub mod cli_args;
pub mod runner;

pub use bootstrap_helpers::init_tracing;
pub use cli_args::{Cli, CliStoreBackend};
pub use runner::{build_store, render_readiness_text, render_summary_text, run_cli};
