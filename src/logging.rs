// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::fmt;

use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Copy, Clone, Debug)]
enum LogFormat {
    Json,
    Compact,
}

/// Install the global subscriber for the host daemon. `CALCD_LOG` overrides
/// the level filter, `CALCD_LOG_FORMAT` selects `json` or `compact` output.
/// Safe to call more than once; later calls are no-ops.
pub fn init(verbose: bool) {
    let filter = build_filter(verbose);
    match parse_format() {
        LogFormat::Json => {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_env_filter(filter)
                .try_init();
        }
        LogFormat::Compact => {
            let _ = tracing_subscriber::fmt()
                .compact()
                .with_timer(UtcTime::rfc_3339())
                .with_env_filter(filter)
                .try_init();
        }
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    match env::var("CALCD_LOG") {
        Ok(value) => EnvFilter::new(value),
        Err(_) => {
            if verbose {
                EnvFilter::new("debug")
            } else {
                EnvFilter::new("info")
            }
        }
    }
}

fn parse_format() -> LogFormat {
    match env::var("CALCD_LOG_FORMAT")
        .ok()
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
    {
        Some(value) if value == "json" => LogFormat::Json,
        _ => LogFormat::Compact,
    }
}

/// Log context identifying one calculation.
///
/// Threaded explicitly through every stage call and prefixed to every
/// message, so that interleaved log lines from concurrently processed
/// calculations stay attributable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalcScope {
    uuid: Uuid,
}

impl CalcScope {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for CalcScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "calc<{}>", self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_display_names_the_calculation() {
        let uuid: Uuid = "abcdef12-3456-7890-abcd-ef1234567890".parse().unwrap();
        let scope = CalcScope::new(uuid);
        assert_eq!(
            scope.to_string(),
            "calc<abcdef12-3456-7890-abcd-ef1234567890>"
        );
    }

    #[test]
    fn init_is_idempotent() {
        init(false);
        init(true);
    }
}
