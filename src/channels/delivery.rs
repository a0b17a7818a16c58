// ABOUTME: Classifies outbound send failures into a transient/terminal taxonomy.
// ABOUTME: Reason codes have the shape class:tag, e.g. transient:rate_limited.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Whether a delivery failure should be retried or surfaced as permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    Transient,
    Terminal,
}

impl fmt::Display for DeliveryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

fn status_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"status[:= ]+([0-9]{3})").unwrap())
}

/// Extract a recognized three-digit status code from a lowercased message.
/// Codes outside the closed set are ignored.
fn extract_status_code(msg: &str) -> u16 {
    let Some(caps) = status_code_re().captures(msg) else {
        return 0;
    };
    match &caps[1] {
        "400" => 400,
        "401" => 401,
        "403" => 403,
        "404" => 404,
        "410" => 410,
        "422" => 422,
        "429" => 429,
        "500" => 500,
        "501" => 501,
        "502" => 502,
        "503" => 503,
        "504" => 504,
        _ => 0,
    }
}

/// Map an outbound send failure to (reason code, class). Checks run in order;
/// the first match wins. No error classifies as transient with an empty code.
pub fn classify_delivery_error(err: Option<&anyhow::Error>) -> (&'static str, DeliveryClass) {
    let Some(err) = err else {
        return ("", DeliveryClass::Transient);
    };
    let msg = format!("{err:#}").trim().to_lowercase();
    let status = extract_status_code(&msg);

    if status == 429 || msg.contains("rate limit") || msg.contains("too many requests") {
        ("transient:rate_limited", DeliveryClass::Transient)
    } else if (500..=599).contains(&status) {
        ("transient:upstream_5xx", DeliveryClass::Transient)
    } else if msg.contains("timeout")
        || msg.contains("tempor")
        || msg.contains("connection refused")
        || msg.contains("connection reset")
    {
        ("transient:network", DeliveryClass::Transient)
    } else if status == 401 || status == 403 {
        ("terminal:unauthorized", DeliveryClass::Terminal)
    } else if matches!(status, 400 | 404 | 410 | 422) {
        (
            "terminal:invalid_target_or_payload",
            DeliveryClass::Terminal,
        )
    } else {
        ("terminal:send_failed", DeliveryClass::Terminal)
    }
}
