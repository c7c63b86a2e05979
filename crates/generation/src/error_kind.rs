use serde::{Deserialize, Serialize};

/// Failure taxonomy surfaced on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientCredits,
    SubmissionError,
    ContentPolicy,
    ProviderFailure,
    Timeout,
    MaterializationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::SubmissionError => "submission_error",
            ErrorKind::ContentPolicy => "content_policy",
            ErrorKind::ProviderFailure => "provider_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MaterializationError => "materialization_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insufficient_credits" => Some(ErrorKind::InsufficientCredits),
            "submission_error" => Some(ErrorKind::SubmissionError),
            "content_policy" => Some(ErrorKind::ContentPolicy),
            "provider_failure" => Some(ErrorKind::ProviderFailure),
            "timeout" => Some(ErrorKind::Timeout),
            "materialization_error" => Some(ErrorKind::MaterializationError),
            _ => None,
        }
    }

    /// Short human-readable line for notifications.
    pub fn describe(&self) -> &'static str {
        match self {
            ErrorKind::InsufficientCredits => "not enough credits",
            ErrorKind::SubmissionError => "the provider rejected the request",
            ErrorKind::ContentPolicy => "the content was blocked by the provider's safety filter",
            ErrorKind::ProviderFailure => "the provider could not complete the generation",
            ErrorKind::Timeout => "the provider did not finish in time",
            ErrorKind::MaterializationError => "the result could not be saved",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CONTENT_POLICY_MARKERS: &[&str] = &[
    "nsfw",
    "content policy",
    "content_policy",
    "safety",
    "moderation",
    "prohibited",
    "sensitive",
    "flagged",
];

/// Map a provider's terminal error text to a failure kind.
pub fn classify_failure(detail: &str) -> ErrorKind {
    let lower = detail.to_ascii_lowercase();
    if CONTENT_POLICY_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::ContentPolicy
    } else {
        ErrorKind::ProviderFailure
    }
}
