use kronk_domain::Error;

/// Map a reqwest error onto the domain error, keeping the timeout
/// distinction the agent loop surfaces to callers.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Reject non-2xx responses with the body text in the error.
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> kronk_domain::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Provider {
        provider: provider.to_string(),
        message: format!("HTTP {status}: {}", truncate(&body, 500)),
    })
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
