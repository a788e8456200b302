//! Host identity extraction.

use url::Url;

use crate::error::{ThrottleError, ThrottleResult};

/// Extract the network location used to key per-host state.
///
/// Accepts full URLs (`https://Example.com:8443/path?q`) as well as bare
/// hosts (`example.com`, `10.0.0.1:8080`). The result is the lowercased host,
/// with `:port` appended only when the URL names a non-default port.
pub fn extract_host(input: &str) -> ThrottleResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ThrottleError::InvalidUrl(input.to_string()));
    }

    let parsed = match Url::parse(trimmed) {
        Ok(url) if url.has_host() => url,
        // "example.com:8080" parses with "example.com" as the scheme
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("http://{}", trimmed))
                .map_err(|_| ThrottleError::InvalidUrl(input.to_string()))?
        }
        Err(_) => return Err(ThrottleError::InvalidUrl(input.to_string())),
    };

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ThrottleError::InvalidUrl(input.to_string()))?;

    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
