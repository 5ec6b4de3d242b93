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
#![allow(clippy::missing_panics_doc)]

//! Shared test helpers used across integration suites.
//! Layout: fixtures.rs (temporary directory roots and fast configs), appliance.rs (scripted appliance and canned responses).

pub mod appliance;
pub mod fixtures;

pub use appliance::{Script, ScriptedAppliance, responses};
pub use fixtures::ScanRoots;
