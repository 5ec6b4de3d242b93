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

//! Client for the threat-emulation appliance file API.
//!
//! Layout: `wire.rs` (request bodies and the typed response view),
//! `verdict.rs` (classifiers over responses), `token.rs` (wire-safe filename
//! tokens), `client.rs` (`ApplianceApi` and the `reqwest` implementation).

pub mod client;
pub mod error;
pub mod token;
pub mod verdict;
pub mod wire;

pub use client::{ApplianceApi, HttpAppliance};
pub use error::{ApplianceError, ApplianceResult};
pub use token::FilenameRegistry;
pub use verdict::{
    LookupOutcome, PollOutcome, UploadOutcome, Verdict, aggregate_archive, child_verdicts,
    classify_lookup, classify_poll, classify_upload,
};
pub use wire::{ApplianceResponse, FeatureView, StatusLabel};
