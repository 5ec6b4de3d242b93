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

//! Scanner configuration: typed model, layered loading, and validation.
//!
//! Layout: `model.rs` (typed settings), `defaults.rs` (built-in values),
//! `loader.rs` (defaults < `TE_*` env < `tescan.yaml` < CLI), `validate.rs`
//! (invariant checks, path normalisation, output-root preparation).

mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use defaults::CONFIG_FILE_NAME;
pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigSources, RawConfig, load};
pub use model::{
    APPLIANCE_API_PATH, APPLIANCE_PORT, ApplianceSettings, DEFAULT_ARCHIVE_EXTENSIONS,
    DirectoryRoots, LogSettings, LogStyle, PollSettings, ScannerConfig, TransferSettings,
    normalize_extensions,
};
pub use validate::normalize_path;
