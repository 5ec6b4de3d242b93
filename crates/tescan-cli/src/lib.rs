#![forbid(unsafe_code)]
#![warn(
    unused,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! `tescan` command-line entry point.
//!
//! Layout:
//! - `cli.rs`: argument parsing, configuration bootstrap, and the batch run
//! - `error.rs`: `CliError` and exit-code mapping
//! - `output.rs`: summary renderers
//! - `main.rs`: thin entrypoint delegating to `run()`

pub(crate) mod cli;
pub(crate) mod error;
pub(crate) mod output;

pub use cli::{run, run_with};
