//! Error message classification
//!
//! Downloader and platform failures arrive as free-form text. This module
//! decides, from that text alone, whether a failure is worth retrying or
//! permanent. Matching is case-insensitive substring matching; the check
//! order matters and is part of the contract:
//!
//! 1. authentication / authorization signals (fatal)
//! 2. server errors 500/502/503/504 (retryable) — checked before the
//!    content-gone signals so that "503 service unavailable" is not mistaken
//!    for "video unavailable"
//! 3. rate limiting (retryable)
//! 4. content gone / not found (fatal)
//! 5. invalid input (fatal)
//! 6. DRM / encrypted content (fatal)
//! 7. network failures (retryable)
//! 8. fragment / incomplete download failures (retryable)
//!
//! Anything else non-empty is retryable: the conservative default for an
//! unrecognized error is to try again later rather than abandon the item.

use serde::{Deserialize, Serialize};

/// Classification of a failure message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failure; retry with backoff
    Retryable,
    /// Permanent failure; retrying cannot succeed
    Fatal,
    /// No error text at all (absent error)
    Unknown,
}

/// Authentication and authorization signals. The upstream requires a login,
/// a subscription, or denies access outright.
const AUTH_SIGNALS: &[&str] = &[
    "subscriber-only",
    "subscribers only",
    "login required",
    "login-required",
    "authentication",
    "unauthorized",
    "401",
    "403",
    "forbidden",
    "access denied",
    "access-denied",
];

/// Upstream 5xx responses. Checked before the content-gone signals because
/// "503 service unavailable" contains "unavailable".
const SERVER_ERROR_SIGNALS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

/// Rate limit pushback.
const RATE_LIMIT_SIGNALS: &[&str] = &["429", "too many requests", "throttled"];

/// The content no longer exists or cannot be extracted. Deliberately narrow:
/// bare "not found" would also match transient "fragment N not found" output,
/// which must stay retryable.
const GONE_SIGNALS: &[&str] = &[
    "404",
    "video unavailable",
    "deleted",
    "no longer available",
    "no video formats",
    "unable to extract",
];

/// The request itself is malformed.
const INVALID_INPUT_SIGNALS: &[&str] = &[
    "invalid url",
    "malformed url",
    "unsupported url",
    "is not a valid url",
];

/// Protected content the downloader cannot handle.
const DRM_SIGNALS: &[&str] = &["drm", "encrypted", "protected content"];

/// Transient network failures.
const NETWORK_SIGNALS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection timed out",
    "timeout",
    "timed out",
    "temporary failure in name resolution",
    "no such host",
    "dns",
    "unexpected eof",
    "eof",
    "broken pipe",
    "network is unreachable",
];

/// Partial-transfer failures the downloader can resume from.
const FRAGMENT_SIGNALS: &[&str] = &[
    "fragment",
    "incomplete",
    "unable to download video data",
    "http error in fragment",
];

/// Classify a failure message.
///
/// Total over its input: every non-empty message maps to [`FailureKind::Retryable`]
/// or [`FailureKind::Fatal`]; only the empty message (no error at all) maps to
/// [`FailureKind::Unknown`].
pub fn classify(message: &str) -> FailureKind {
    if message.trim().is_empty() {
        return FailureKind::Unknown;
    }

    let lowered = message.to_lowercase();
    let matches_any = |signals: &[&str]| signals.iter().any(|s| lowered.contains(s));

    if matches_any(AUTH_SIGNALS) {
        return FailureKind::Fatal;
    }
    if matches_any(SERVER_ERROR_SIGNALS) {
        return FailureKind::Retryable;
    }
    if matches_any(RATE_LIMIT_SIGNALS) {
        return FailureKind::Retryable;
    }
    if matches_any(GONE_SIGNALS) {
        return FailureKind::Fatal;
    }
    if matches_any(INVALID_INPUT_SIGNALS) {
        return FailureKind::Fatal;
    }
    if matches_any(DRM_SIGNALS) {
        return FailureKind::Fatal;
    }
    if matches_any(NETWORK_SIGNALS) {
        return FailureKind::Retryable;
    }
    if matches_any(FRAGMENT_SIGNALS) {
        return FailureKind::Retryable;
    }

    FailureKind::Retryable
}
