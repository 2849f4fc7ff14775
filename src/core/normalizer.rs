//! Request normalization.
//!
//! Turns the raw request target and headers into the stable form that routing,
//! admission and logging all read:
//! * the path keeps its existing escapes; bytes that cannot appear in a URL
//!   (non-ASCII, control) are escaped as uppercase `%XX`
//! * query values are form-decoded, keys have `.` replaced by `_`, repeated
//!   keys are comma-joined and bare flags become `"true"`; every value stays a
//!   string
//! * a fixed allow-list of headers is captured and truncated before anything
//!   else looks at it
//!
//! The only hard failure is an oversized request line.

use std::{fmt::Write as _, net::IpAddr};

use base64::{Engine, engine::general_purpose::STANDARD};
use http::{HeaderMap, HeaderName, header};
use serde::{Serialize, Serializer, ser::SerializeMap};

/// Maximum length kept for captured header values.
pub const MAX_HEADER_LENGTH: usize = 200;
/// User-Agent gets a larger allowance.
pub const MAX_USER_AGENT_LENGTH: usize = 400;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NormalizeError {
    #[error("request line of {length} bytes exceeds the {limit} byte limit")]
    RequestLineTooLong { length: usize, limit: usize },
}

/// The request as delivered by the HTTP server, before any interpretation.
#[derive(Debug, Clone, Copy)]
pub struct RawRequest<'a> {
    pub method: &'a str,
    /// Request target exactly as received: path plus optional `?query`.
    pub target: &'a [u8],
    /// Protocol token of the request line, e.g. `HTTP/1.1`.
    pub version: &'a str,
    pub headers: &'a HeaderMap,
    /// Scheme after proxy resolution.
    pub scheme: &'a str,
    pub client_ip: IpAddr,
    pub body_size: u64,
}

impl RawRequest<'_> {
    /// Length of `METHOD SP target SP version CRLF`.
    pub fn request_line_len(&self) -> usize {
        self.method.len() + 1 + self.target.len() + 1 + self.version.len() + 2
    }
}

/// Ordered query mapping; every value is a single string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// Add an occurrence, comma-joining onto an existing key.
    pub fn append(&mut self, key: String, value: String) {
        if let Some((_, existing)) = self.0.iter_mut().find(|(k, _)| *k == key) {
            existing.push(',');
            existing.push_str(&value);
        } else {
            self.0.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Serialize for QueryParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Allow-listed request headers, already truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedHeaders {
    pub accept: Option<String>,
    pub accept_encoding: Option<String>,
    pub connection: Option<String>,
    pub content_type: Option<String>,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub method: String,
    pub scheme: String,
    /// Raw Host header (port included), truncated.
    pub host: String,
    pub client_ip: IpAddr,
    pub path: String,
    /// Raw query string with unsafe bytes escaped; `None` when the target had no `?`.
    pub raw_query: Option<String>,
    pub query: QueryParams,
    pub hierarchy: Vec<String>,
    pub headers: CapturedHeaders,
    pub basic_auth_username: Option<String>,
    /// First API key candidate found in header, query or basic auth.
    pub api_key: Option<String>,
    pub url: String,
    pub size: u64,
}

impl NormalizedRequest {
    /// Path and query as they should be re-serialized into a URL.
    pub fn path_and_query(&self) -> String {
        match &self.raw_query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    max_request_line: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(8192)
    }
}

impl Normalizer {
    pub fn new(max_request_line: usize) -> Self {
        Self { max_request_line }
    }

    pub fn max_request_line(&self) -> usize {
        self.max_request_line
    }

    /// Fails only when the request line exceeds the configured ceiling.
    pub fn normalize(&self, raw: &RawRequest<'_>) -> Result<NormalizedRequest, NormalizeError> {
        let line_len = raw.request_line_len();
        if line_len > self.max_request_line {
            return Err(NormalizeError::RequestLineTooLong {
                length: line_len,
                limit: self.max_request_line,
            });
        }

        let (raw_path, raw_query) = match raw.target.iter().position(|&b| b == b'?') {
            Some(idx) => (&raw.target[..idx], Some(&raw.target[idx + 1..])),
            None => (raw.target, None),
        };

        let path = escape_unsafe_bytes(raw_path);
        let raw_query = raw_query.map(escape_unsafe_bytes);
        let query = raw_query
            .as_deref()
            .map(parse_query)
            .unwrap_or_default();

        let headers = capture_headers(raw.headers);
        let host = headers.host.clone().unwrap_or_default();
        let hierarchy = build_hierarchy(&host, &path);
        let basic_auth_username = basic_auth_username(raw.headers);

        let api_key = raw
            .headers
            .get("x-api-key")
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .filter(|k| !k.is_empty())
            .or_else(|| {
                query
                    .get("api_key")
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
            })
            .or_else(|| basic_auth_username.clone().filter(|u| !u.is_empty()));

        let mut url = format!("{}://{}{}", raw.scheme, host, path);
        if let Some(query) = &raw_query {
            url.push('?');
            url.push_str(query);
        }

        Ok(NormalizedRequest {
            method: raw.method.to_string(),
            scheme: raw.scheme.to_string(),
            host,
            client_ip: raw.client_ip,
            path,
            raw_query,
            query,
            hierarchy,
            headers,
            basic_auth_username,
            api_key,
            url,
            size: request_size(raw, line_len),
        })
    }
}

fn needs_escape(byte: u8) -> bool {
    byte >= 0x80 || byte <= 0x20 || byte == 0x7f
}

/// Escape non-ASCII, control and space bytes as `%XX`; everything else,
/// including existing escapes and backslashes, is kept verbatim.
pub fn escape_unsafe_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if needs_escape(byte) {
            let _ = write!(out, "%{byte:02X}");
        } else {
            out.push(byte as char);
        }
    }
    out
}

fn decode_component(component: &str) -> String {
    let plus_as_space = component.replace('+', " ");
    let decoded = urlencoding::decode_binary(plus_as_space.as_bytes());
    escape_unsafe_decoded(&decoded)
}

/// After form-decoding, only non-ASCII and control bytes are re-escaped;
/// spaces survive as spaces.
fn escape_unsafe_decoded(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if byte >= 0x80 || byte < 0x20 || byte == 0x7f {
            let _ = write!(out, "%{byte:02X}");
        } else {
            out.push(byte as char);
        }
    }
    out
}

/// Parse a raw query string into string-only key/value pairs.
pub fn parse_query(raw_query: &str) -> QueryParams {
    let mut params = QueryParams::default();
    for piece in raw_query.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, value) = match piece.split_once('=') {
            Some((k, v)) => (k, decode_component(v)),
            None => (piece, "true".to_string()),
        };
        let key = decode_component(raw_key).replace('.', "_");
        if key.is_empty() {
            continue;
        }
        params.append(key, value);
    }
    params
}

/// `"0/{host}/"`, then one entry per path segment; only the last entry
/// omits the trailing slash.
pub fn build_hierarchy(host: &str, path: &str) -> Vec<String> {
    let mut hierarchy = vec![format!("0/{host}/")];
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return hierarchy;
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    let mut so_far = String::new();
    for (i, segment) in segments.iter().enumerate() {
        so_far.push_str(segment);
        let depth = i + 1;
        if depth == segments.len() {
            hierarchy.push(format!("{depth}/{host}/{so_far}"));
        } else {
            so_far.push('/');
            hierarchy.push(format!("{depth}/{host}/{so_far}"));
        }
    }
    hierarchy
}

/// Truncate to `max` characters.
pub fn truncate(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// Header value as text; a value that is not UTF-8 is captured as empty.
fn header_text(headers: &HeaderMap, name: &HeaderName, max: usize) -> Option<String> {
    headers.get(name).map(|v| {
        std::str::from_utf8(v.as_bytes())
            .map(|text| truncate(text, max))
            .unwrap_or_default()
    })
}

fn capture_headers(headers: &HeaderMap) -> CapturedHeaders {
    CapturedHeaders {
        accept: header_text(headers, &header::ACCEPT, MAX_HEADER_LENGTH),
        accept_encoding: header_text(headers, &header::ACCEPT_ENCODING, MAX_HEADER_LENGTH),
        connection: header_text(headers, &header::CONNECTION, MAX_HEADER_LENGTH),
        content_type: header_text(headers, &header::CONTENT_TYPE, MAX_HEADER_LENGTH),
        host: header_text(headers, &header::HOST, MAX_HEADER_LENGTH),
        origin: header_text(headers, &header::ORIGIN, MAX_HEADER_LENGTH),
        referer: header_text(headers, &header::REFERER, MAX_HEADER_LENGTH),
        user_agent: header_text(headers, &header::USER_AGENT, MAX_USER_AGENT_LENGTH),
    }
}

fn basic_auth_username(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credentials) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(credentials.trim()).ok()?;
    let decoded = String::from_utf8_lossy(&decoded);
    let username = decoded.split(':').next().unwrap_or_default();
    Some(truncate(username, MAX_HEADER_LENGTH))
}

/// Bytes on the wire: request line, header block and body.
fn request_size(raw: &RawRequest<'_>, line_len: usize) -> u64 {
    let header_bytes: usize = raw
        .headers
        .iter()
        .map(|(name, value)| name.as_str().len() + 2 + value.len() + 2)
        .sum();
    (line_len + header_bytes + 2) as u64 + raw.body_size
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn headers(host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_str(host).unwrap());
        headers
    }

    fn normalize(target: &[u8], headers: &HeaderMap) -> NormalizedRequest {
        let raw = RawRequest {
            method: "GET",
            target,
            version: "HTTP/1.1",
            headers,
            scheme: "http",
            client_ip: "127.0.0.1".parse().unwrap(),
            body_size: 0,
        };
        Normalizer::default().normalize(&raw).unwrap()
    }

    #[test]
    fn hierarchy_has_one_entry_per_segment() {
        let req = normalize(b"/api/logging-example/foo/bar/?x=1", &headers("127.0.0.1:9080"));
        assert_eq!(
            req.hierarchy,
            vec![
                "0/127.0.0.1:9080/",
                "1/127.0.0.1:9080/api/",
                "2/127.0.0.1:9080/api/logging-example/",
                "3/127.0.0.1:9080/api/logging-example/foo/",
                "4/127.0.0.1:9080/api/logging-example/foo/bar",
            ]
        );
        assert_eq!(build_hierarchy("h", "/"), vec!["0/h/"]);
    }

    #[test]
    fn query_keys_replace_dots_and_keep_brackets() {
        let req = normalize(b"/hello?foo.bar.baz=x&foo[bar]=y&a.b[c.d]=z", &headers("h"));
        assert_eq!(req.query.get("foo_bar_baz"), Some("x"));
        assert_eq!(req.query.get("foo[bar]"), Some("y"));
        assert_eq!(req.query.get("a_b[c_d]"), Some("z"));
    }

    #[test]
    fn repeated_keys_are_comma_joined_without_coercion() {
        let req = normalize(
            b"/hello?n=1&n=2.5&b=true&b=false&d=2010-05-01&d=nope&flag",
            &headers("h"),
        );
        assert_eq!(req.query.get("n"), Some("1,2.5"));
        assert_eq!(req.query.get("b"), Some("true,false"));
        assert_eq!(req.query.get("d"), Some("2010-05-01,nope"));
        assert_eq!(req.query.get("flag"), Some("true"));
        let json = serde_json::to_value(&req.query).unwrap();
        assert!(json["n"].is_string());
    }

    #[test]
    fn query_values_are_decoded_and_non_ascii_re_escaped() {
        let req = normalize(
            "/hello?utf8=%E2%9C%93&raw=✓&plus=a+b&bad=%A3&slash=\\x".as_bytes(),
            &headers("h"),
        );
        assert_eq!(req.query.get("utf8"), Some("%E2%9C%93"));
        assert_eq!(req.query.get("raw"), Some("%E2%9C%93"));
        assert_eq!(req.query.get("plus"), Some("a b"));
        assert_eq!(req.query.get("bad"), Some("%A3"));
        assert_eq!(req.query.get("slash"), Some("\\x"));
    }

    #[test]
    fn path_keeps_escapes_and_escapes_raw_bytes() {
        let target = [
            b"/hello/%E2%9C%93/".as_slice(),
            "✓".as_bytes(),
            b"/\xA3/\\x".as_slice(),
        ]
        .concat();
        let req = normalize(&target, &headers("h"));
        assert_eq!(req.path, "/hello/%E2%9C%93/%E2%9C%93/%A3/\\x");
        assert!(req.url.starts_with("http://h/hello/%E2%9C%93/%E2%9C%93/%A3/"));

        let replacement = normalize("/r/\u{FFFD}".as_bytes(), &headers("h"));
        assert_eq!(replacement.path, "/r/%EF%BF%BD");
    }

    #[test]
    fn url_reuses_the_escaped_raw_query() {
        let req = normalize(b"/hello?foo=%20bar&utf8=\xE2\x9C\x93", &headers("example.com"));
        assert_eq!(req.url, "http://example.com/hello?foo=%20bar&utf8=%E2%9C%93");
        assert_eq!(req.path_and_query(), "/hello?foo=%20bar&utf8=%E2%9C%93");
    }

    #[test]
    fn normalizing_twice_is_stable() {
        let h = headers("h");
        let first = normalize("/a/✓?k.x=%E2%9C%93&k.x=2".as_bytes(), &h);
        let second = normalize(first.path_and_query().as_bytes(), &h);
        // Wire size follows the raw bytes; everything derived from them is stable.
        assert_eq!(
            NormalizedRequest {
                size: first.size,
                ..second
            },
            first
        );
    }

    #[test]
    fn headers_are_truncated_before_use() {
        let mut h = headers(&"h".repeat(300));
        h.insert(header::USER_AGENT, HeaderValue::from_str(&"u".repeat(500)).unwrap());
        h.insert(header::ACCEPT, HeaderValue::from_static("text/\"quoted\"\\"));
        let req = normalize(b"/", &h);
        assert_eq!(req.host.len(), 200);
        assert_eq!(req.headers.user_agent.as_ref().unwrap().len(), 400);
        assert_eq!(req.headers.accept.as_deref(), Some("text/\"quoted\"\\"));
    }

    #[test]
    fn non_utf8_headers_are_captured_empty() {
        let mut h = headers("h");
        h.insert(header::ORIGIN, HeaderValue::from_bytes(b"http://caf\xE9.example").unwrap());
        h.insert(header::REFERER, HeaderValue::from_static("http://example.com/"));
        let req = normalize(b"/", &h);
        assert_eq!(req.headers.origin.as_deref(), Some(""));
        assert_eq!(req.headers.referer.as_deref(), Some("http://example.com/"));
    }

    #[test]
    fn api_key_sources_in_order() {
        let mut h = headers("h");
        h.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic QkFTSUNfS0VZOnNlY3JldA=="),
        );
        let req = normalize(b"/?api_key=QUERY_KEY", &h);
        assert_eq!(req.api_key.as_deref(), Some("QUERY_KEY"));
        assert_eq!(req.basic_auth_username.as_deref(), Some("BASIC_KEY"));

        let req = normalize(b"/", &h);
        assert_eq!(req.api_key.as_deref(), Some("BASIC_KEY"));

        h.insert("x-api-key", HeaderValue::from_static("HEADER_KEY"));
        let req = normalize(b"/?api_key=QUERY_KEY", &h);
        assert_eq!(req.api_key.as_deref(), Some("HEADER_KEY"));
    }

    #[test]
    fn request_line_ceiling() {
        let h = headers("h");
        // "GET " + target + " HTTP/1.1\r\n"
        let at_limit = format!("/{}", "a".repeat(8192 - 4 - 11 - 1));
        let raw = RawRequest {
            method: "GET",
            target: at_limit.as_bytes(),
            version: "HTTP/1.1",
            headers: &h,
            scheme: "http",
            client_ip: "127.0.0.1".parse().unwrap(),
            body_size: 0,
        };
        assert_eq!(raw.request_line_len(), 8192);
        assert!(Normalizer::default().normalize(&raw).is_ok());

        let over = format!("{at_limit}a");
        let raw = RawRequest {
            target: over.as_bytes(),
            ..raw
        };
        assert_eq!(
            Normalizer::default().normalize(&raw),
            Err(NormalizeError::RequestLineTooLong {
                length: 8193,
                limit: 8192
            })
        );
    }
}
