//! `ErrorClassifier`: a pure, table-driven mapping from a raw ESP error
//! string to a `ClassifiedError`.
//!
//! The pattern tables below reproduce spec.md §9 verbatim. Adding a new
//! provider means adding a table + one arm in `classify`, never touching the
//! status-extraction or fallback logic.

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::error::{ClassifiedError, ErrorKind};
use crate::types::ProviderKind;

struct PatternTable {
    recipient: &'static [&'static str],
    provider: &'static [&'static str],
}

const SES: PatternTable = PatternTable {
    recipient: &[
        "messagerejected",
        "email address is not verified",
        "invalid recipient",
        "mailbox unavailable",
        "mailbox not found",
        "user unknown",
        "address rejected",
        "no recipients",
        "recipient rejected",
    ],
    provider: &[
        "throttling",
        "throttlingexception",
        "limitexceeded",
        "quota exceeded",
        "daily message quota",
        "serviceunavailable",
        "accessdenied",
        "invalidclienttokenid",
        "signaturedoesnotmatch",
        "expiredtoken",
        "account paused",
        "sending paused",
        "configurationset",
    ],
};

const POSTMARK: PatternTable = PatternTable {
    recipient: &[
        "inactive recipient",
        "invalid email",
        "invalid address",
        "hard bounce",
        "hardbounce",
        "unsubscribed",
        "spam complaint",
        "recipient not found",
        "mailbox not found",
    ],
    provider: &[
        "rate limit",
        "ratelimit",
        "too many requests",
        "unauthorized",
        "authentication",
        "invalid api",
        "api key",
        "server error",
        "internal error",
        "service unavailable",
    ],
};

const MAILGUN: PatternTable = PatternTable {
    recipient: &[
        "550",
        "551",
        "552",
        "553",
        "554",
        "mailbox unavailable",
        "mailbox not found",
        "user not found",
        "user unknown",
        "no such user",
        "recipient rejected",
        "invalid recipient",
        "does not exist",
        "storage exceeded",
        "mailbox full",
    ],
    provider: &[
        "421",
        "unauthorized",
        "forbidden",
        "rate limit",
        "too many requests",
        "service unavailable",
        "internal server error",
        "bad gateway",
        "authentication failed",
        "invalid api key",
        "api key",
    ],
};

const MAILJET: PatternTable = PatternTable {
    recipient: &[
        "hard_bounce",
        "hardbounce",
        "hard bounce",
        "error_related_to",
        "blocked",
        "preblocked",
        "invalid recipient",
        "user unknown",
        "mailbox not found",
        "duplicate in campaign",
    ],
    provider: &[
        "unauthorized",
        "authentication",
        "not found",
        "rate limit",
        "too many requests",
        "service unavailable",
        "internal server error",
        "bad gateway",
        "api key",
    ],
};

const SPARKPOST: PatternTable = PatternTable {
    recipient: &[
        "5002",
        "2008",
        "no valid recipients",
        "invalid recipient",
        "recipient rejected",
        "mailbox not found",
        "user unknown",
    ],
    provider: &[
        "rate limit",
        "too many requests",
        "throttl",
        "service unavailable",
        "internal server error",
        "transmission error",
        "sending limit",
        "api error",
        "authentication",
        "unauthorized",
    ],
};

const SMTP: PatternTable = PatternTable {
    recipient: &[
        "550",
        "551",
        "552",
        "553",
        "5.1.1",
        "5.1.2",
        "5.1.3",
        "5.2.1",
        "5.2.2",
        "5.7.1",
        "mailbox unavailable",
        "mailbox not found",
        "user unknown",
        "no such user",
        "recipient rejected",
        "does not exist",
        "mailbox full",
        "over quota",
    ],
    provider: &[
        "421",
        "450",
        "451",
        "452",
        "4.7.1",
        "connection refused",
        "connection reset",
        "connection timeout",
        "timed out",
        "timeout",
        "tls handshake",
        "tls error",
        "ssl error",
        "authentication failed",
        "auth failed",
        "login failed",
        "service unavailable",
        "try again later",
        "temporary failure",
        "greylisted",
        "greylist",
    ],
};

fn any_match(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

// Three status-extraction regexes tried in order; the first that matches
// wins. Compiled once and reused across every classify() call.
static STATUS_PATTERNS: Lazy<Vec<regex::Regex>> = Lazy::new(|| {
    vec![
        regex::Regex::new(r"(?i)status[_ ]?code[:\s]*(\d{3})").expect("valid literal pattern"),
        regex::Regex::new(r"(?i)http[/\d.]*\s*(\d{3})").expect("valid literal pattern"),
        regex::Regex::new(r"[\[(](\d{3})[\])]").expect("valid literal pattern"),
    ]
});

// Used only to short-circuit classify() when nothing in any provider's
// fallback path would ever need a regex scan (kept as a RegexSet so the
// common "no digits at all" case is a single cheap check).
static HAS_DIGITS: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new([r"\d"]).expect("valid literal pattern"));

fn extract_http_status(err: &str) -> u16 {
    if !HAS_DIGITS.is_match(err) {
        return 0;
    }
    for re in STATUS_PATTERNS.iter() {
        if let Some(caps) = re.captures(err) {
            if let Some(m) = caps.get(1) {
                if let Ok(code) = m.as_str().parse::<u16>() {
                    return code;
                }
            }
        }
    }
    0
}

fn status_fallback(status: u16) -> (ErrorKind, bool) {
    match status {
        406 => (ErrorKind::Recipient, false),
        429 => (ErrorKind::Provider, true),
        401 | 403 => (ErrorKind::Provider, false),
        s if s >= 500 => (ErrorKind::Provider, true),
        s if (400..500).contains(&s) => (ErrorKind::Unknown, false),
        _ => (ErrorKind::Unknown, true),
    }
}

/// Classify a raw ESP error string for the given provider.
///
/// Returns `None` iff `err` is `None`, matching spec.md §8 property 4:
/// `classify(nil, k) == nil` for all providers `k`.
pub fn classify(err: Option<&str>, provider: ProviderKind) -> Option<ClassifiedError> {
    let err = err?;
    let lower = err.to_lowercase();
    let status = extract_http_status(&lower);

    let (kind, retryable) = match provider {
        ProviderKind::Ses => classify_ses(&lower, status),
        ProviderKind::Postmark => classify_postmark(&lower, status),
        ProviderKind::Mailgun => classify_mailgun(&lower, status),
        ProviderKind::Mailjet => classify_mailjet(&lower, status),
        ProviderKind::SparkPost => classify_sparkpost(&lower, status),
        ProviderKind::Smtp => classify_smtp(&lower, status),
    };

    Some(ClassifiedError {
        original: err.to_string(),
        provider,
        http_status: status,
        kind,
        retryable,
    })
}

fn classify_ses(lower: &str, status: u16) -> (ErrorKind, bool) {
    if any_match(lower, SES.recipient) {
        if (lower.contains("sender") || lower.contains("from address")) && lower.contains("not verified")
        {
            return (ErrorKind::Provider, false);
        }
        return (ErrorKind::Recipient, false);
    }

    if any_match(lower, SES.provider) {
        let auth_class = lower.contains("accessdenied")
            || lower.contains("invalidclienttokenid")
            || lower.contains("expiredtoken")
            || lower.contains("signaturedoesnotmatch");
        if auth_class {
            return (ErrorKind::Provider, false);
        }
        let retryable = status >= 500
            || status == 429
            || lower.contains("throttl")
            || lower.contains("quota");
        return (ErrorKind::Provider, retryable);
    }

    if status > 0 {
        return status_fallback(status);
    }
    (ErrorKind::Unknown, true)
}

fn classify_postmark(lower: &str, status: u16) -> (ErrorKind, bool) {
    if status == 406 {
        return (ErrorKind::Recipient, false);
    }
    if any_match(lower, POSTMARK.recipient) {
        return (ErrorKind::Recipient, false);
    }
    if any_match(lower, POSTMARK.provider) {
        let retryable =
            status >= 500 || status == 429 || lower.contains("rate limit") || lower.contains("too many");
        return (ErrorKind::Provider, retryable);
    }
    if status > 0 {
        return status_fallback(status);
    }
    (ErrorKind::Unknown, true)
}

fn classify_mailgun(lower: &str, status: u16) -> (ErrorKind, bool) {
    if any_match(lower, MAILGUN.recipient) {
        return (ErrorKind::Recipient, false);
    }
    if any_match(lower, MAILGUN.provider) {
        if status == 401 {
            return (ErrorKind::Provider, false);
        }
        let retryable = status >= 500
            || status == 429
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("service unavailable");
        return (ErrorKind::Provider, retryable);
    }
    if status > 0 {
        return status_fallback(status);
    }
    (ErrorKind::Unknown, true)
}

fn classify_mailjet(lower: &str, status: u16) -> (ErrorKind, bool) {
    if any_match(lower, MAILJET.recipient) {
        return (ErrorKind::Recipient, false);
    }
    if any_match(lower, MAILJET.provider) {
        let retryable = status >= 500
            || status == 429
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("service unavailable");
        return (ErrorKind::Provider, retryable);
    }
    if status > 0 {
        return status_fallback(status);
    }
    (ErrorKind::Unknown, true)
}

fn classify_sparkpost(lower: &str, status: u16) -> (ErrorKind, bool) {
    if any_match(lower, SPARKPOST.recipient) {
        return (ErrorKind::Recipient, false);
    }
    if any_match(lower, SPARKPOST.provider) {
        let retryable = status >= 500
            || status == 429
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("throttl")
            || lower.contains("service unavailable");
        return (ErrorKind::Provider, retryable);
    }
    if status > 0 {
        return status_fallback(status);
    }
    (ErrorKind::Unknown, true)
}

fn classify_smtp(lower: &str, status: u16) -> (ErrorKind, bool) {
    if any_match(lower, SMTP.recipient) {
        return (ErrorKind::Recipient, false);
    }
    if any_match(lower, SMTP.provider) {
        // SMTP: every provider-pattern hit is treated as a temporary failure.
        return (ErrorKind::Provider, true);
    }
    if status > 0 {
        return status_fallback(status);
    }
    (ErrorKind::Unknown, true)
}
