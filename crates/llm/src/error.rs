use std::fmt;

/// Failure families an OpenAI-compatible endpoint can surface to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    Connectivity,
    Authentication,
    RateLimit,
    Api,
}

const AUTHENTICATION_STATUSES: &[&str] = &["401", "403"];
const AUTHENTICATION_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "incorrect api key",
    "invalid_api_key",
    "authentication",
];
const RATE_LIMIT_STATUSES: &[&str] = &["429"];
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "insufficient_quota",
];
const CONNECTIVITY_MARKERS: &[&str] = &[
    "error sending request",
    "connection",
    "connect",
    "dns",
    "timed out",
    "timeout",
    "refused",
    "reset by peer",
    "broken pipe",
    "unreachable",
    "stream ended",
];

impl ApiErrorKind {
    /// Derives the failure family from a transport or provider error description.
    ///
    /// rig flattens HTTP failures into strings, so status codes and well-known
    /// phrases are the only stable signal left by the time an error reaches us.
    pub fn classify(description: &str) -> Self {
        let lowered = description.to_ascii_lowercase();

        if contains_status(&lowered, AUTHENTICATION_STATUSES)
            || contains_any(&lowered, AUTHENTICATION_MARKERS)
        {
            return Self::Authentication;
        }

        if contains_status(&lowered, RATE_LIMIT_STATUSES)
            || contains_any(&lowered, RATE_LIMIT_MARKERS)
        {
            return Self::RateLimit;
        }

        if contains_any(&lowered, CONNECTIVITY_MARKERS) {
            return Self::Connectivity;
        }

        Self::Api
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Connectivity => "connection error",
            Self::Authentication => "authentication error",
            Self::RateLimit => "rate limit exceeded",
            Self::Api => "API error",
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// API-originated failure, already classified, ready to be shown to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiFailure {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_description(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ApiErrorKind::classify(&message), message)
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiFailure {}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

// A status code only counts when it is not part of a longer number (e.g. a port).
fn contains_status(haystack: &str, codes: &[&str]) -> bool {
    codes.iter().any(|code| {
        haystack.match_indices(code).any(|(start, _)| {
            let before = haystack[..start].chars().next_back();
            let after = haystack[start + code.len()..].chars().next();
            !before.is_some_and(|ch| ch.is_ascii_digit())
                && !after.is_some_and(|ch| ch.is_ascii_digit())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(
            ApiErrorKind::classify("HttpError: Invalid status code: 401 Unauthorized"),
            ApiErrorKind::Authentication
        );
        assert_eq!(
            ApiErrorKind::classify("Invalid status code 429 with message: slow down"),
            ApiErrorKind::RateLimit
        );
        assert_eq!(
            ApiErrorKind::classify("ProviderError: model `foo` not found"),
            ApiErrorKind::Api
        );
    }

    #[test]
    fn ports_are_not_mistaken_for_statuses() {
        assert_eq!(
            ApiErrorKind::classify("error sending request for url (http://localhost:14290/v1)"),
            ApiErrorKind::Connectivity
        );
    }

    #[test]
    fn connection_failures_are_connectivity() {
        assert_eq!(
            ApiErrorKind::classify("tcp connect error: Connection refused (os error 111)"),
            ApiErrorKind::Connectivity
        );
        assert_eq!(
            ApiErrorKind::classify("operation timed out"),
            ApiErrorKind::Connectivity
        );
    }

    #[test]
    fn failure_display_carries_kind_label() {
        let failure = ApiFailure::from_description("Incorrect API key provided");
        assert_eq!(failure.kind, ApiErrorKind::Authentication);
        assert_eq!(
            failure.to_string(),
            "authentication error: Incorrect API key provided"
        );
    }
}
