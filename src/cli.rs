//! # CLI
//!
//! Flags for the one-shot `yale` binary plus the rotate-window type the
//! reconciler consults.

use crate::error::{Error, Result};
use chrono::NaiveTime;
use clap::Parser;

/// Yale: cluster-resident credential lifecycle controller.
///
/// Runs a single reconcile pass over every GcpSaKey and AzureClientSecret
/// in the cluster, then exits. Exit code 0 on overall success, non-zero on
/// any unrecovered error.
#[derive(Debug, Parser)]
#[command(name = "yale", version)]
pub struct Cli {
    /// Use operator-local cluster credentials (kubeconfig) rather than
    /// in-cluster credentials
    #[arg(long, default_value_t = false)]
    pub local: bool,

    /// Kubeconfig location when --local is set
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Namespace holding the cache Secrets
    #[arg(long = "cache-namespace", default_value = "yale-cache")]
    pub cache_namespace: String,

    /// Require a last-authentication check before disabling a rotated key
    #[arg(long = "check-in-use", default_value_t = true, action = clap::ArgAction::Set)]
    pub check_in_use: bool,

    /// Start of the rotate window, HH:MM (24-hour, UTC). Both window flags
    /// must be set together.
    #[arg(long = "window-start")]
    pub window_start: Option<String>,

    /// End of the rotate window, HH:MM (24-hour, UTC)
    #[arg(long = "window-end")]
    pub window_end: Option<String>,
}

impl Cli {
    /// Resolve the window flags into a [`RotateWindow`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when only one flag is set, a time does not
    /// parse, or start is not strictly before end.
    pub fn rotate_window(&self) -> Result<Option<RotateWindow>> {
        match (&self.window_start, &self.window_end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => RotateWindow::parse(start, end).map(Some),
            _ => Err(Error::Config(
                "--window-start and --window-end must be set together".to_string(),
            )),
        }
    }
}

/// Time-of-day window confining disruptive rotations to low-traffic hours.
/// Disable and delete still run outside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl RotateWindow {
    /// Parse `HH:MM` bounds; start must be strictly before end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed times or an empty window.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |value: &str, flag: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                Error::Config(format!("{flag} '{value}' is not a valid 24-hour HH:MM time"))
            })
        };
        let start = parse(start, "--window-start")?;
        let end = parse(end, "--window-end")?;
        if start >= end {
            return Err(Error::Config(format!(
                "rotate window start {start} must be strictly before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// True when `time` falls inside the window.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_parse_and_contains() {
        let window = RotateWindow::parse("02:00", "05:30").unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(2, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(5, 30, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
    }

    #[test]
    fn test_window_rejects_inverted_bounds() {
        assert!(RotateWindow::parse("05:00", "02:00").is_err());
        assert!(RotateWindow::parse("05:00", "05:00").is_err());
    }

    #[test]
    fn test_window_rejects_malformed_time() {
        assert!(RotateWindow::parse("25:00", "26:00").is_err());
        assert!(RotateWindow::parse("2am", "5am").is_err());
    }

    #[test]
    fn test_cli_requires_both_window_flags() {
        let cli = Cli::parse_from(["yale", "--window-start", "02:00"]);
        assert!(cli.rotate_window().is_err());

        let cli = Cli::parse_from(["yale", "--window-start", "02:00", "--window-end", "04:00"]);
        assert!(cli.rotate_window().unwrap().is_some());

        let cli = Cli::parse_from(["yale"]);
        assert!(cli.rotate_window().unwrap().is_none());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["yale"]);
        assert_eq!(cli.cache_namespace, "yale-cache");
        assert!(cli.check_in_use);
        assert!(!cli.local);
    }

    #[test]
    fn test_check_in_use_accepts_explicit_value() {
        let cli = Cli::parse_from(["yale", "--check-in-use", "false"]);
        assert!(!cli.check_in_use);
    }
}
