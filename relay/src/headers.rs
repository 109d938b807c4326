//! HTTP Request Head Parsing and Header Rewriting
//!
//! The vhost listener only looks at the head of the first request on a connection: enough to
//! route by `Host`, enforce basic auth and inject proxy headers. Bodies are streamed untouched.

use std::fmt::Write as _;

use bytes::Bytes;
use lighttunnel_shared::TunnelRequest;

/// Heads larger than this are refused.
pub const MAX_HEAD_LEN: usize = 64 * 1024;
/// Heads with more headers than this are refused.
pub const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeadParse {
    /// Head plus the number of bytes it occupied, including the blank line.
    Complete(RequestHead, usize),
    Partial,
    Invalid,
}

pub fn parse_head(buf: &[u8]) -> HeadParse {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut slots);
    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) if len <= MAX_HEAD_LEN => len,
        Ok(httparse::Status::Partial) if buf.len() <= MAX_HEAD_LEN => return HeadParse::Partial,
        Ok(_) | Err(_) => return HeadParse::Invalid,
    };

    let (Some(method), Some(target), Some(minor)) = (request.method, request.path, request.version)
    else {
        return HeadParse::Invalid;
    };
    let mut headers = Vec::with_capacity(request.headers.len());
    for header in request.headers.iter() {
        let Ok(value) = std::str::from_utf8(header.value) else {
            return HeadParse::Invalid;
        };
        headers.push((header.name.to_string(), value.trim().to_string()));
    }

    HeadParse::Complete(
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: format!("HTTP/1.{minor}"),
            headers,
        },
        len,
    )
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Host` without its port, or `None` when missing or empty.
    pub fn vhost(&self) -> Option<&str> {
        let host = self.header("Host")?.trim();
        let host = if host.starts_with('[') {
            // [v6]:port
            match host.find(']') {
                Some(end) => &host[..=end],
                None => return None,
            }
        } else {
            host.split(':').next().unwrap_or_default()
        };
        (!host.is_empty()).then_some(host)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(256);
        let _ = write!(out, "{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        out.push_str("\r\n");
        Bytes::from(out)
    }
}

/// Header rewrite rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderRule {
    /// Add header (won't overwrite existing)
    Add(String, String),
    /// Set header (overwrites existing)
    Set(String, String),
}

/// Header rewriter for one tunnel: X-Forwarded-* and X-Real-IP, then the tunnel's own rules.
#[derive(Debug, Clone, Default)]
pub struct HeaderRewriter {
    /// Custom rules applied in order, after the proxy headers
    pub rules: Vec<HeaderRule>,
}

impl HeaderRewriter {
    /// Rules carried in the request's `proxy_set_headers` / `proxy_add_headers` extras.
    pub fn for_request(request: &TunnelRequest) -> Self {
        let rules = request
            .proxy_set_headers()
            .into_iter()
            .map(|(k, v)| HeaderRule::Set(k, v))
            .chain(
                request
                    .proxy_add_headers()
                    .into_iter()
                    .map(|(k, v)| HeaderRule::Add(k, v)),
            )
            .collect();
        Self { rules }
    }

    /// Rewrite request headers before forwarding to the client
    pub fn rewrite_request(
        &self,
        headers: &mut Vec<(String, String)>,
        client_ip: &str,
        host: &str,
        https: bool,
    ) {
        let forwarded_for = match headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("X-Forwarded-For"))
        {
            Some((_, existing)) => format!("{existing}, {client_ip}"),
            None => client_ip.to_string(),
        };
        upsert(headers, "X-Forwarded-For", &forwarded_for);
        upsert(headers, "X-Forwarded-Proto", if https { "https" } else { "http" });
        upsert(headers, "X-Forwarded-Host", host);
        upsert(headers, "X-Real-IP", client_ip);

        for rule in &self.rules {
            match rule {
                HeaderRule::Add(k, v) => {
                    if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case(k)) {
                        headers.push((k.clone(), v.clone()));
                    }
                }
                HeaderRule::Set(k, v) => upsert(headers, k, v),
            }
        }
    }
}

/// Insert or update a header
fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(raw: &[u8]) -> (RequestHead, usize) {
        match parse_head(raw) {
            HeadParse::Complete(head, len) => (head, len),
            other => panic!("expected complete head, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_head() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: a.example.com:8080\r\nAccept: */*\r\n\r\nBODY";
        let (head, len) = complete(raw);
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/index.html");
        assert_eq!(head.header("host"), Some("a.example.com:8080"));
        assert_eq!(head.vhost(), Some("a.example.com"));
        assert_eq!(&raw[len..], b"BODY");
    }

    #[test]
    fn test_partial_and_invalid() {
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nHost: a"), HeadParse::Partial);
        assert_eq!(parse_head(b"NOT-HTTP\r\n\r\n"), HeadParse::Invalid);
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n"), HeadParse::Invalid);
        assert_eq!(parse_head(&vec![b'a'; MAX_HEAD_LEN + 1]), HeadParse::Invalid);
        assert_eq!(parse_head(b""), HeadParse::Partial);
    }

    #[test]
    fn test_head_limits() {
        let mut crowded = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            crowded.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        crowded.extend_from_slice(b"\r\n");
        assert_eq!(parse_head(&crowded), HeadParse::Invalid);

        let mut huge = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        huge.resize(MAX_HEAD_LEN + 16, b'p');
        huge.extend_from_slice(b"\r\n\r\n");
        assert_eq!(parse_head(&huge), HeadParse::Invalid);

        let (head, _) = complete(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n");
        assert_eq!(head.version, "HTTP/1.0");
    }

    #[test]
    fn test_vhost_variants() {
        let (head, _) = complete(b"GET / HTTP/1.1\r\nHost: [::1]:80\r\n\r\n");
        assert_eq!(head.vhost(), Some("[::1]"));
        let (head, _) = complete(b"GET / HTTP/1.1\r\nHost: \r\n\r\n");
        assert_eq!(head.vhost(), None);
        let (head, _) = complete(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(head.vhost(), None);
    }

    #[test]
    fn test_head_roundtrip() {
        let raw = b"POST /api HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\n";
        let (head, _) = complete(raw);
        assert_eq!(&head.to_bytes()[..], &raw[..]);
    }

    #[test]
    fn test_proxy_headers() {
        let rw = HeaderRewriter::default();
        let mut h = vec![("Host".into(), "example.com".into())];
        rw.rewrite_request(&mut h, "1.2.3.4", "myapp.example.com", true);
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-For" && v == "1.2.3.4"));
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-Proto" && v == "https"));
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-Host" && v == "myapp.example.com"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let rw = HeaderRewriter::default();
        let mut h = vec![("x-forwarded-for".into(), "10.0.0.1".into())];
        rw.rewrite_request(&mut h, "1.2.3.4", "h", false);
        assert_eq!(h[0].1, "10.0.0.1, 1.2.3.4");
    }

    #[test]
    fn test_rules_from_request() {
        let request = TunnelRequest::for_http(false, "127.0.0.1", 80, "h")
            .with_proxy_set_headers(&[("X-Env".into(), "dev".into())])
            .with_proxy_add_headers(&[
                ("X-Team".into(), "core".into()),
                ("Accept".into(), "text/plain".into()),
            ]);
        let rw = HeaderRewriter::for_request(&request);
        let mut h = vec![
            ("X-Env".into(), "prod".into()),
            ("Accept".into(), "*/*".into()),
        ];
        rw.rewrite_request(&mut h, "1.2.3.4", "h", false);
        let pairs: Vec<(&str, &str)> = h.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(
            pairs,
            vec![
                ("X-Env", "dev"),
                ("Accept", "*/*"),
                ("X-Forwarded-For", "1.2.3.4"),
                ("X-Forwarded-Proto", "http"),
                ("X-Forwarded-Host", "h"),
                ("X-Real-IP", "1.2.3.4"),
                ("X-Team", "core"),
            ]
        );
    }
}
