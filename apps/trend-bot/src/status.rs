//! Status file for dashboards.
//!
//! After every cycle the bot writes a small JSON document describing what it
//! last saw and did. Export is best-effort: failures are logged and never
//! fail the cycle.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::persistence::{StoreError, write_atomic};

/// Snapshot written to the status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Traded symbol.
    pub symbol: String,
    /// Bot status, e.g. `running`, `skipped`, `error`.
    pub status: String,
    /// When the report was produced.
    pub timestamp: DateTime<Utc>,
    /// Quantity held.
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_position: Option<Decimal>,
    /// Latest price.
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_price: Option<Decimal>,
    /// Account equity.
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub account_value: Option<Decimal>,
    /// Last strategy signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<String>,
    /// Circuit breaker state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_status: Option<String>,
    /// Additional top-level fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusReport {
    /// Report with only the required fields.
    #[must_use]
    pub fn new(symbol: impl Into<String>, status: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            status: status.into(),
            timestamp: at,
            current_position: None,
            current_price: None,
            account_value: None,
            last_signal: None,
            circuit_breaker_status: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Add an extra field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Writes [`StatusReport`]s to a fixed path.
#[derive(Debug, Clone)]
pub struct StatusExporter {
    path: PathBuf,
}

impl StatusExporter {
    /// Exporter writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `report`; returns whether it succeeded.
    pub fn export(&self, report: &StatusReport) -> bool {
        match self.try_export(report) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Status exported");
                true
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to export status");
                false
            }
        }
    }

    fn try_export(&self, report: &StatusReport) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(report)?;
        write_atomic(&self.path, &bytes)?;
        set_group_readable(&self.path)
    }
}

#[cfg(unix)]
fn set_group_readable(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o664)).map_err(|source| {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_group_readable(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 11, 20, 0, 0).unwrap()
    }

    #[test]
    fn optional_fields_are_omitted() {
        let report = StatusReport::new("BTC/USD", "running", at());
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["symbol"], "BTC/USD");
        assert_eq!(json["status"], "running");
        assert!(json.get("current_price").is_none());
        assert!(json.get("last_signal").is_none());
    }

    #[test]
    fn decimals_are_numbers_and_extra_is_flattened() {
        let report = StatusReport {
            current_price: Some(dec!(42000.5)),
            last_signal: Some("BUY".into()),
            ..StatusReport::new("BTC/USD", "running", at())
        }
        .with_extra("sma", 41000.25);

        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["current_price"], 42000.5);
        assert_eq!(json["last_signal"], "BUY");
        assert_eq!(json["sma"], 41000.25);
    }

    #[test]
    fn export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = StatusExporter::new(dir.path().join("www/status.json"));
        let report = StatusReport {
            circuit_breaker_status: Some("CLOSED".into()),
            ..StatusReport::new("SPY", "running", at())
        };

        assert!(exporter.export(&report));

        let written: StatusReport =
            serde_json::from_slice(&std::fs::read(exporter.path()).unwrap()).unwrap();
        assert_eq!(written, report);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(exporter.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o664);
        }
    }

    #[test]
    fn export_failure_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();

        let exporter = StatusExporter::new(blocker.join("status.json"));
        assert!(!exporter.export(&StatusReport::new("SPY", "error", at())));
    }
}
