use pingora::http::RequestHeader;
use pingora::prelude::*;

use pkg_types::ingress::normalize_host;

pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_FORWARDED_PORT: &str = "X-Forwarded-Port";
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";

/// Routing host of a request: the Host header, else the URI authority,
/// normalized.
pub fn request_host(req: &RequestHeader) -> String {
    let raw = req
        .headers
        .get("host")
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri.host())
        .unwrap_or("");
    normalize_host(raw)
}

pub fn header_str<'a>(req: &'a RequestHeader, name: &str) -> Option<&'a str> {
    req.headers.get(name).and_then(|v| v.to_str().ok())
}

/// `https://` location for the same host, path and query.
pub fn redirect_location(host: &str, req: &RequestHeader) -> String {
    let path_and_query = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("https://{}{}", host, path_and_query)
}

/// Set the forwarding headers on an upstream request.
///
/// `X-Forwarded-For` is appended to; `X-Forwarded-Port` and
/// `X-Forwarded-Proto` are only set when the client did not send them.
pub fn apply_forwarded_headers(
    req: &mut RequestHeader,
    client_ip: Option<&str>,
    port: u16,
    proto: &str,
) -> Result<()> {
    if let Some(ip) = client_ip {
        let value = match header_str(req, X_FORWARDED_FOR) {
            Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior, ip),
            _ => ip.to_string(),
        };
        req.insert_header(X_FORWARDED_FOR, value)?;
    }
    if req.headers.get(X_FORWARDED_PORT).is_none() {
        req.insert_header(X_FORWARDED_PORT, port.to_string())?;
    }
    if req.headers.get(X_FORWARDED_PROTO).is_none() {
        req.insert_header(X_FORWARDED_PROTO, proto)?;
    }
    Ok(())
}
