//! The opening handshake: an HTTP/1.1 Upgrade request built from a `WsUrl`, and incremental
//! validation of the server's 101 response. Response validation is a pure function over an
//! accumulated byte slice, mirroring the Framer's own "need more bytes" shape (§4.2).

use crate::error::Error;
use crate::url::WsUrl;
use crate::utils::generate_websocket_accept_value;

pub fn build_request(url: &WsUrl, key: &str, extra_headers: &[(String, String)]) -> String {
    let mut request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n",
        path = url.path_with_query,
        host = url.host_header,
        key = key,
    );

    // Last-wins on duplicate header names (§4.2).
    let mut ordered: Vec<(String, String)> = Vec::new();
    for (name, value) in extra_headers {
        match ordered.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(existing) => existing.1 = value.clone(),
            None => ordered.push((name.clone(), value.clone())),
        }
    }
    for (name, value) in ordered {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request
}

/// Scans `buf` for a complete, valid 101 response.
///
/// Returns `Ok(None)` if the `\r\n\r\n` terminator hasn't arrived yet — the caller must
/// accumulate more bytes and retry. On success returns the number of leading bytes that made up
/// the HTTP response; any bytes beyond that are the start of the WebSocket stream and must be
/// forwarded to the Framer, never discarded.
pub fn try_validate_response(buf: &[u8], sent_key: &str) -> Result<Option<usize>, Error> {
    const TERMINATOR: &[u8] = b"\r\n\r\n";
    let Some(term_idx) = find_subslice(buf, TERMINATOR) else {
        return Ok(None);
    };

    let header_str = std::str::from_utf8(&buf[..term_idx])
        .map_err(|_| Error::HandshakeRejected("response headers are not valid UTF-8".into()))?;

    let mut lines = header_str.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| Error::HandshakeRejected("empty response".into()))?;
    if !status_line.starts_with("HTTP/1.1 101") {
        return Err(Error::HandshakeRejected(format!(
            "expected HTTP/1.1 101, got: {status_line}"
        )));
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut accept: Option<String> = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => {
                connection_ok = value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            }
            "sec-websocket-accept" => accept = Some(value.to_string()),
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err(Error::HandshakeRejected(
            "missing or invalid Upgrade header".into(),
        ));
    }
    if !connection_ok {
        return Err(Error::HandshakeRejected(
            "missing or invalid Connection header".into(),
        ));
    }

    let expected = generate_websocket_accept_value(sent_key.to_string());
    match accept {
        Some(ref got) if *got == expected => Ok(Some(term_idx + TERMINATOR.len())),
        Some(got) => Err(Error::HandshakeRejected(format!(
            "Sec-WebSocket-Accept mismatch: expected {expected}, got {got}"
        ))),
        None => Err(Error::HandshakeRejected(
            "missing Sec-WebSocket-Accept header".into(),
        )),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
