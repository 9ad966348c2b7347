//! URL construction for the kernel server.
//!
//! Path segments are appended through `Url::path_segments_mut`, which
//! percent-encodes each one, so kernel ids and session ids can be passed
//! through as-is.

use reqwest::Url;

#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("invalid url {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("url cannot be used as a base: {0}")]
    CannotBeABase(String),

    #[error("unsupported url scheme: {0}")]
    Scheme(String),
}

pub fn parse(url: &str) -> Result<Url, UrlError> {
    Url::parse(url).map_err(|e| UrlError::Parse {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn with_segments(base: &Url, segments: &[&str]) -> Result<Url, UrlError> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| UrlError::CannotBeABase(base.to_string()))?;
        path.pop_if_empty().extend(segments);
    }
    Ok(url)
}

/// `{base}/api/kernels`
pub fn kernels_url(base: &Url) -> Result<Url, UrlError> {
    with_segments(base, &["api", "kernels"])
}

/// `{base}/api/kernels/{id}`
pub fn kernel_url(base: &Url, id: &str) -> Result<Url, UrlError> {
    with_segments(base, &["api", "kernels", id])
}

/// `{base}/api/kernels/{id}/{action}` (`interrupt`, `restart`).
pub fn kernel_action_url(base: &Url, id: &str, action: &str) -> Result<Url, UrlError> {
    with_segments(base, &["api", "kernels", id, action])
}

/// `{base}/api/sessions`
pub fn sessions_url(base: &Url) -> Result<Url, UrlError> {
    with_segments(base, &["api", "sessions"])
}

/// `{base}/api/sessions/{id}`
pub fn session_url(base: &Url, id: &str) -> Result<Url, UrlError> {
    with_segments(base, &["api", "sessions", id])
}

/// Websocket base derived from an http base (`http` to `ws`, `https` to `wss`).
pub fn ws_base(base: &Url) -> Result<Url, UrlError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(UrlError::Scheme(other.to_string())),
    };
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| UrlError::Scheme(base.scheme().to_string()))?;
    Ok(url)
}

/// `{ws_base}/api/kernels/{id}/channels?session_id={session}[&token={token}]`
pub fn channels_url(
    ws_base: &Url,
    kernel_id: &str,
    session_id: &str,
    token: Option<&str>,
) -> Result<Url, UrlError> {
    let mut url = with_segments(ws_base, &["api", "kernels", kernel_id, "channels"])?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("session_id", session_id);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    Ok(url)
}
