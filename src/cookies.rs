//! Cookie isolation for environments sharing one browser cookie jar
//!
//! Every environment on this host shares the browser's cookies per
//! cookie-domain. Without isolation, logging into one environment
//! overwrites the session cookie another environment depends on. The
//! rewriter namespaces cookies with a per-environment suffix derived from
//! the environment's port and the process-wide configured marker:
//!
//! - Responses: every `Set-Cookie: name=value` additionally emits
//!   `name-<port>-<marker>=value` with the same attributes. The original
//!   stays so the unsuffixed name keeps working for single-environment use.
//! - Requests: pairs already carrying the marker are stripped, and for
//!   every plain pair the suffixed shadow's value wins when present.
//!
//! The suffix is recomputed from `(port, marker)` on both paths, never from
//! request-local state, so the two directions always agree.

use hyper::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use std::collections::HashMap;

/// Per-environment cookie-name suffix: `-<port>-<marker>`.
pub fn env_suffix(port: u16, marker: &str) -> String {
    format!("-{}-{}", port, marker)
}

/// Parse a `Cookie` request header into name/value pairs.
///
/// Unparseable fragments (no `=`, empty name) are dropped, not fatal.
pub fn parse_cookie_pairs(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|fragment| {
            let (name, value) = fragment.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Rewrite a browser `Cookie` header before it is forwarded upstream.
///
/// Pairs whose name ends with the marker are the per-environment shadows;
/// they are never forwarded as-is. For every remaining pair, the value of
/// its shadow for this environment replaces the plain value when the shadow
/// exists in the jar.
pub fn rewrite_request_cookies(header: &str, port: u16, marker: &str) -> String {
    let pairs = parse_cookie_pairs(header);
    let jar: HashMap<&str, &str> = pairs
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();

    let suffix = env_suffix(port, marker);
    let mut rewritten = Vec::with_capacity(pairs.len());

    for (name, value) in &pairs {
        if name.ends_with(marker) {
            continue;
        }
        let shadow = format!("{}{}", name, suffix);
        let value = jar.get(shadow.as_str()).copied().unwrap_or(value.as_str());
        rewritten.push(format!("{}={}", name, value));
    }

    rewritten.join("; ")
}

/// Build the suffixed shadow for one `Set-Cookie` header value.
///
/// Returns the shadow header value (`name<suffix>=value; attrs...`) with
/// the attribute tail carried over verbatim. Returns `None` when the header
/// is unparseable or the name already carries the marker, so that a cookie
/// shadowed on one proxy hop is not shadowed again on the next.
pub fn shadow_set_cookie(header: &str, port: u16, marker: &str) -> Option<String> {
    let (pair, attrs) = match header.split_once(';') {
        Some((pair, attrs)) => (pair, Some(attrs)),
        None => (header, None),
    };

    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.ends_with(marker) {
        return None;
    }

    let shadow_name = format!("{}{}", name, env_suffix(port, marker));
    Some(match attrs {
        Some(attrs) => format!("{}={};{}", shadow_name, value.trim(), attrs),
        None => format!("{}={}", shadow_name, value.trim()),
    })
}

/// Rewrite a request's `Cookie` header in place (outbound direction).
///
/// Must run before the request is sent upstream. A header that rewrites to
/// nothing is removed entirely.
pub fn rewrite_cookie_header(headers: &mut HeaderMap, port: u16, marker: &str) {
    let Some(value) = headers.get(COOKIE).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let rewritten = rewrite_request_cookies(value, port, marker);
    if rewritten.is_empty() {
        headers.remove(COOKIE);
    } else if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(COOKIE, value);
    }
}

/// Append the suffixed shadow for every `Set-Cookie` header in a response
/// (inbound direction). Must run before the response is flushed to the
/// browser. Originals are kept; shadows are appended after them.
pub fn append_set_cookie_shadows(headers: &mut HeaderMap, port: u16, marker: &str) {
    let shadows: Vec<HeaderValue> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| shadow_set_cookie(v, port, marker))
        .filter_map(|s| HeaderValue::from_str(&s).ok())
        .collect();
    for shadow in shadows {
        headers.append(SET_COOKIE, shadow);
    }
}
