//! Parses a `ws://`/`wss://` URL into the pieces the Engine needs to open a transport and build
//! the handshake request. Delegates the heavy lifting to the `url` crate, matching the teacher
//! crate's own use of `url::Url` in `request.rs`.

use crate::error::Error;
use url::Url;

#[derive(Debug, Clone)]
pub struct WsUrl {
    pub use_tls: bool,
    pub host: String,
    pub port: u16,
    /// `Host` header value — includes the port only when the URL specified a non-default one.
    pub host_header: String,
    pub path_with_query: String,
}

pub fn parse_ws_url(raw: &str) -> Result<WsUrl, Error> {
    let parsed = Url::parse(raw)?;

    let (use_tls, default_port) = match parsed.scheme() {
        "ws" => (false, 80),
        "wss" => (true, 443),
        _ => return Err(Error::InvalidSchemeUrl),
    };

    let host = parsed.host_str().ok_or(Error::UrlNoHost)?.to_string();
    let port = parsed.port().unwrap_or(default_port);

    let host_header = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.clone(),
    };

    let path_with_query = match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => {
            let path = parsed.path();
            if path.is_empty() {
                "/".to_string()
            } else {
                path.to_string()
            }
        }
    };

    Ok(WsUrl {
        use_tls,
        host,
        port,
        host_header,
        path_with_query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ws_url() {
        let url = parse_ws_url("ws://localhost:8080/echo?id=1").unwrap();
        assert!(!url.use_tls);
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 8080);
        assert_eq!(url.host_header, "localhost:8080");
        assert_eq!(url.path_with_query, "/echo?id=1");
    }

    #[test]
    fn defaults_path_to_root_and_port_to_scheme_default() {
        let url = parse_ws_url("wss://example.com").unwrap();
        assert!(url.use_tls);
        assert_eq!(url.port, 443);
        assert_eq!(url.host_header, "example.com");
        assert_eq!(url.path_with_query, "/");
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        assert!(matches!(
            parse_ws_url("http://example.com"),
            Err(Error::InvalidSchemeUrl)
        ));
    }
}
