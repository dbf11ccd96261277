//! Length-prefixed pair encoding and random identifier generation.
//!
//! The codec joins two strings into `"<len(first)>&<first><second>"` and is
//! chainable: the second half may itself be an encoded pair.

use axum::http::HeaderMap;
use rand::rngs::OsRng;
use rand::RngCore;

use super::types::{Error, Result};

const DELIMITER: char = '&';
const ALPHANUM: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generate a random identifier of `n` characters drawn from `[0-9A-Za-z]`.
///
/// The bytes come from the operating system CSPRNG, so the result is safe to
/// use as an unguessable socket or session identifier.
pub(crate) fn random_string(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| ALPHANUM[(*b as usize) % ALPHANUM.len()] as char)
        .collect()
}

/// Join two values into a single string decodable by [`unmarshal_values`].
pub fn marshal_values(first: &str, second: &str) -> String {
    let mut out = String::with_capacity(first.len() + second.len() + 12);
    out.push_str(&first.len().to_string());
    out.push(DELIMITER);
    out.push_str(first);
    out.push_str(second);
    out
}

/// Split two values from a single string.
///
/// Fails on a missing delimiter, a non-numeric length prefix, or a length
/// that is out of bounds for the remaining data.
pub fn unmarshal_values(data: &str) -> Result<(&str, &str)> {
    let pos = data
        .find(DELIMITER)
        .ok_or_else(|| Error::Protocol(format!("unmarshal values: no delimiter found: '{data}'")))?;

    let len: usize = data[..pos]
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid value length: '{}'", &data[..pos])))?;

    let rest = &data[pos + DELIMITER.len_utf8()..];
    if len > rest.len() {
        return Err(Error::Protocol(format!(
            "invalid value length: out of bounds: '{len}'"
        )));
    }

    // The length is a byte count; reject splits that fall inside a UTF-8
    // sequence rather than panicking.
    let first = rest
        .get(..len)
        .ok_or_else(|| Error::Protocol(format!("invalid value length: out of bounds: '{len}'")))?;

    Ok((first, &rest[len..]))
}

/// Obtain the client IP for a request.
///
/// `X-Forwarded-For` (first entry) and `X-Real-Ip` take precedence over the
/// connection peer address, which has its port stripped.
pub(crate) fn remote_address(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// The `User-Agent` header value, or an empty string.
pub(crate) fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
