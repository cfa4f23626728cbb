//! Downloader output parsing.
//!
//! The external downloader reports progress on its diagnostic stream as lines
//! like:
//!
//! ```text
//! [download]  42.3% of 1.21GiB at 5.12MiB/s ETA 01:23
//! ```
//!
//! The canonical regex below is the single authority for extracting the
//! percentage and total size — both the supervisor (live updates) and the
//! progress endpoint (re-deriving percent from a stored state line) use it.
//! It tracks the downloader's output format; if that format changes, this
//! regex is the one place to update.
//!
//! Non-progress output is kept in a bounded ring of recent lines for error
//! reporting, with credential material scrubbed before storage.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;

/// Maximum diagnostic lines retained for error tails
const TAIL_CAPACITY: usize = 100;

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(
        r"(?P<percent>\d{1,3}(?:\.\d+)?)%(?:\s+of\s+~?\s*(?P<total>\d+(?:\.\d+)?)(?P<unit>[KMGT]iB|B)\b)?",
    )
    .expect("progress regex is valid")
});

static COOKIE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)(cookie:\s*)\S.*").expect("cookie regex is valid")
});

static AUTH_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)(auth-token=)[^\s;&]+").expect("auth token regex is valid")
});

/// One parsed progress report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    /// Percent complete, 0.0..=100.0
    pub percent: f64,
    /// Total size in bytes when the line carried one
    pub bytes_total: Option<u64>,
}

impl ProgressUpdate {
    /// Bytes downloaded so far, derived from percent and total
    pub fn bytes_done(&self) -> Option<u64> {
        self.bytes_total
            .map(|total| ((self.percent / 100.0) * total as f64) as u64)
    }
}

/// Parse a downloader output line as a progress report
pub fn parse_progress(line: &str) -> Option<ProgressUpdate> {
    let captures = PROGRESS_RE.captures(line)?;
    let percent: f64 = captures.name("percent")?.as_str().parse().ok()?;
    if !(0.0..=100.0).contains(&percent) {
        return None;
    }

    let bytes_total = match (captures.name("total"), captures.name("unit")) {
        (Some(total), Some(unit)) => parse_bytes(total.as_str(), unit.as_str()),
        _ => None,
    };

    Some(ProgressUpdate {
        percent,
        bytes_total,
    })
}

/// Extract just the percentage from a stored download-state line
pub fn parse_percent(state: &str) -> Option<f64> {
    parse_progress(state).map(|p| p.percent)
}

fn parse_bytes(value: &str, unit: &str) -> Option<u64> {
    let number: f64 = value.parse().ok()?;
    let multiplier: f64 = match unit {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    Some((number * multiplier) as u64)
}

/// Redact credential material from a diagnostic line
pub fn scrub_secrets(line: &str) -> String {
    let scrubbed = COOKIE_RE.replace_all(line, "${1}[redacted]");
    AUTH_TOKEN_RE
        .replace_all(&scrubbed, "${1}[redacted]")
        .into_owned()
}

/// Bounded ring of recent non-progress downloader output
#[derive(Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    /// Create an empty tail
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scrubbed line, evicting the oldest beyond capacity
    pub fn push(&mut self, line: &str) {
        if self.lines.len() == TAIL_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(scrub_secrets(line));
    }

    /// Number of retained lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether no lines are retained
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The last `n` retained lines joined for an error message
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}
