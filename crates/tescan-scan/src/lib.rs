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

//! Scan orchestration: the per-file state machine, report artifacts, and the
//! batch coordinator that schedules files onto the ordinary and archive lanes.
//!
//! Layout: `state.rs` (`ScanState`, `FileTask`), `orchestrator.rs`
//! (`ScanOrchestrator`), `report.rs` (transcripts and downloaded reports),
//! `record.rs` (per-file results and batch summary), `batch.rs`
//! (`BatchCoordinator`).

pub mod batch;
pub mod error;
pub mod orchestrator;
pub mod record;
pub mod report;
pub mod state;

pub use batch::{BatchCoordinator, LaneReport};
pub use error::{ScanError, ScanResult};
pub use orchestrator::ScanOrchestrator;
pub use record::{BatchSummary, ScanRecord};
pub use report::{REPORT_SUFFIX, ReportWriter, TRANSCRIPT_SUFFIX, Transcript};
pub use state::{FileTask, ScanState};
