//! Validation and path normalisation for resolved configuration.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::thread;

use tracing::{info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::model::ScannerConfig;

/// Lexically normalise `path`: expand a leading `~`, anchor relative paths
/// at `base`, and fold `.`/`..` components. The path need not exist.
#[must_use]
pub fn normalize_path(path: &Path, base: &Path, home: Option<&Path>) -> PathBuf {
    let expanded = match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    };
    let anchored = if expanded.is_absolute() || is_unc(&expanded) {
        expanded
    } else {
        base.join(expanded)
    };

    let mut normalized = PathBuf::new();
    for component in anchored.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never climb above the root.
                if matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn is_unc(path: &Path) -> bool {
    path.to_str()
        .is_some_and(|text| text.starts_with(r"\\") || text.starts_with("//"))
}

impl ScannerConfig {
    /// Check every invariant the scan engine relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule: missing appliance address, a numeric
    /// field below 1, two roots sharing a path, an output root nested inside
    /// the input root, or a missing input directory.
    pub fn validate(&self) -> ConfigResult<()> {
        self.appliance.endpoint()?;

        ensure_positive(
            "concurrency",
            u64::try_from(self.concurrency).unwrap_or(u64::MAX),
        )?;
        ensure_positive("seconds_to_wait", self.poll.interval.as_secs())?;
        ensure_positive("max_retries", u64::from(self.poll.max_attempts))?;
        ensure_positive("transfer_retries", u64::from(self.transfer.max_retries))?;
        ensure_positive("request_retries", u64::from(self.appliance.request_retries))?;
        ensure_positive("http_timeout", self.appliance.http_timeout.as_secs())?;

        let named = self.roots.named();
        for (index, &(first, first_path)) in named.iter().enumerate() {
            for &(second, second_path) in named.iter().skip(index + 1) {
                if first_path == second_path {
                    return Err(ConfigError::DuplicateRoot {
                        first,
                        second,
                        path: first_path.to_path_buf(),
                    });
                }
            }
        }
        for (field, path) in self.roots.outputs() {
            if path.starts_with(&self.roots.input) {
                return Err(ConfigError::NestedRoot {
                    outer: "input_directory",
                    inner: field,
                });
            }
            if self.roots.input.starts_with(path) {
                return Err(ConfigError::NestedRoot {
                    outer: field,
                    inner: "input_directory",
                });
            }
        }

        if !self.roots.input.is_dir() {
            return Err(ConfigError::invalid(
                "input_directory",
                "must be an existing directory",
                self.roots.input.display(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::InvalidField {
                field: "log_level",
                reason: "must not be empty",
                value: None,
            });
        }
        Ok(())
    }

    /// Create every missing output root, retrying transient failures with the
    /// transfer backoff so slow network mounts get a chance to respond.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] once the retry budget is spent.
    pub fn prepare_directories(&self) -> ConfigResult<()> {
        for (field, path) in self.roots.outputs() {
            let mut delay = self.transfer.initial_backoff;
            let mut attempt = 1;
            loop {
                match fs::create_dir_all(path) {
                    Ok(()) => break,
                    Err(source) if attempt >= self.transfer.max_retries => {
                        return Err(ConfigError::io("config.prepare_directories", path, source));
                    }
                    Err(error) => {
                        warn!(
                            field,
                            path = %path.display(),
                            attempt,
                            error = %error,
                            "output directory creation failed; retrying"
                        );
                        thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                        attempt += 1;
                    }
                }
            }
        }
        info!(
            reports = %self.roots.reports.display(),
            benign = %self.roots.benign.display(),
            quarantine = %self.roots.quarantine.display(),
            error = %self.roots.error.display(),
            "output directories ready"
        );
        Ok(())
    }
}

fn ensure_positive(field: &'static str, value: u64) -> ConfigResult<()> {
    if value < 1 {
        return Err(ConfigError::invalid(field, "must be at least 1", value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{ConfigSources, RawConfig, load};
    use tempfile::TempDir;

    type TestResult = anyhow::Result<()>;

    fn loaded(base: &TempDir, cli: RawConfig) -> anyhow::Result<ScannerConfig> {
        fs::create_dir_all(base.path().join("input_files"))?;
        Ok(load(&ConfigSources {
            cli,
            base_dir: base.path().to_path_buf(),
            ..ConfigSources::default()
        })?)
    }

    fn with_address() -> RawConfig {
        RawConfig {
            appliance_ip: Some("10.1.1.1".to_string()),
            ..RawConfig::default()
        }
    }

    #[test]
    fn normalize_folds_dot_segments() {
        let base = Path::new("/srv/scan");
        assert_eq!(
            normalize_path(Path::new("./a/../b/./c"), base, None),
            PathBuf::from("/srv/scan/b/c")
        );
        assert_eq!(
            normalize_path(Path::new("/../../x"), base, None),
            PathBuf::from("/x")
        );
        assert_eq!(
            normalize_path(Path::new("~"), base, Some(Path::new("/home/op"))),
            PathBuf::from("/home/op")
        );
    }

    #[test]
    fn valid_configuration_passes() -> TestResult {
        let base = TempDir::new()?;
        let config = loaded(&base, with_address())?;
        config.validate()?;
        Ok(())
    }

    #[test]
    fn missing_address_is_rejected() -> TestResult {
        let base = TempDir::new()?;
        let config = loaded(&base, RawConfig::default())?;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField {
                field: "appliance_ip"
            })
        ));
        Ok(())
    }

    #[test]
    fn zero_numeric_fields_are_rejected() -> TestResult {
        let base = TempDir::new()?;
        for cli in [
            RawConfig {
                concurrency: Some(0),
                ..with_address()
            },
            RawConfig {
                seconds_to_wait: Some(0),
                ..with_address()
            },
            RawConfig {
                max_retries: Some(0),
                ..with_address()
            },
            RawConfig {
                transfer_retries: Some(0),
                ..with_address()
            },
        ] {
            let config = loaded(&base, cli)?;
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidField { reason, .. } if reason == "must be at least 1"),
                "unexpected error: {err:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn duplicate_roots_are_rejected_after_normalisation() -> TestResult {
        let base = TempDir::new()?;
        let config = loaded(
            &base,
            RawConfig {
                benign_directory: Some(PathBuf::from("out/./clean")),
                error_directory: Some(PathBuf::from("out/x/../clean")),
                ..with_address()
            },
        )?;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateRoot {
                first: "benign_directory",
                second: "error_directory",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn output_root_inside_input_is_rejected() -> TestResult {
        let base = TempDir::new()?;
        let config = loaded(
            &base,
            RawConfig {
                quarantine_directory: Some(PathBuf::from("input_files/q")),
                ..with_address()
            },
        )?;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NestedRoot {
                inner: "quarantine_directory",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn missing_input_directory_is_rejected() -> TestResult {
        let base = TempDir::new()?;
        let config = load(&ConfigSources {
            cli: with_address(),
            base_dir: base.path().to_path_buf(),
            ..ConfigSources::default()
        })?;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidField {
                field: "input_directory",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn prepare_directories_creates_output_roots() -> TestResult {
        let base = TempDir::new()?;
        let config = loaded(&base, with_address())?;
        config.prepare_directories()?;
        for (_, path) in config.roots.outputs() {
            assert!(path.is_dir(), "{} missing", path.display());
        }
        Ok(())
    }
}
