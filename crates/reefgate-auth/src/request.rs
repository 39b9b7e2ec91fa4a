//! Request model for the authentication pipeline
//!
//! The gateway hands every incoming request to the pipeline as a
//! [`GatewayRequest`]: http types for the envelope plus a takeable [`Body`]
//! so that integrity binders can wrap the byte stream in place.

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, Method, Uri};
use reefgate_common::ApiError;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;

/// Pull-based request body: a stream of byte chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Wrap an [`ApiError`] so it can travel through an `io::Error` boundary.
pub fn io_error(err: ApiError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Recover the [`ApiError`] carried by an `io::Error`, if any.
pub fn api_error(err: &io::Error) -> Option<ApiError> {
    err.get_ref().and_then(|e| e.downcast_ref::<ApiError>()).copied()
}

/// Request body
///
/// Starts out as whatever the transport produced; binders `take` it and put
/// a wrapping stream back.
pub struct Body(BodyInner);

enum BodyInner {
    Empty,
    Full(Bytes),
    Stream(ByteStream),
}

impl Body {
    pub fn empty() -> Self {
        Self(BodyInner::Empty)
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(BodyInner::Full(bytes.into()))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self(BodyInner::Stream(stream.boxed()))
    }

    /// Take the body out, leaving an empty one behind.
    pub fn take(&mut self) -> Body {
        std::mem::replace(self, Body::empty())
    }

    pub fn into_stream(self) -> ByteStream {
        match self.0 {
            BodyInner::Empty => futures::stream::empty().boxed(),
            BodyInner::Full(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            BodyInner::Stream(stream) => stream,
        }
    }

    /// Drain the body into memory, rejecting payloads larger than `limit`.
    pub async fn read_all(self, limit: usize) -> Result<Bytes, ApiError> {
        let mut stream = self.into_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| api_error(&e).unwrap_or(ApiError::InternalError))?;
            if buf.len() + chunk.len() > limit {
                return Err(ApiError::EntityTooLarge);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            BodyInner::Empty => f.write_str("Body::Empty"),
            BodyInner::Full(b) => write!(f, "Body::Full({} bytes)", b.len()),
            BodyInner::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

/// An incoming HTTP request as seen by the pipeline
#[derive(Debug)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<IpAddr>,
    pub body: Body,
    /// Request id echoed in error responses and log context
    pub request_id: String,
    form: Option<HashMap<String, Vec<String>>>,
}

impl GatewayRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            remote_addr: None,
            body: Body::empty(),
            request_id: uuid::Uuid::new_v4().to_string(),
            form: None,
        }
    }

    /// Add a header (builder style, for embedding code and tests).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Get a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Parse the query string into the form map. Idempotent; the classifier
    /// calls this once per request.
    pub fn parse_form(&mut self) -> Result<(), ApiError> {
        if self.form.is_some() {
            return Ok(());
        }
        let mut form: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(query) = self.uri.query() {
            for (key, value) in query_pairs(query).ok_or(ApiError::InvalidQueryParams)? {
                form.entry(key).or_default().push(value);
            }
        }
        self.form = Some(form);
        Ok(())
    }

    pub fn form(&self) -> Option<&HashMap<String, Vec<String>>> {
        self.form.as_ref()
    }

    /// First value of a query parameter, if the form has been parsed.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.form
            .as_ref()?
            .get(name)?
            .first()
            .map(String::as_str)
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.form
            .as_ref()
            .is_some_and(|f| f.contains_key(name))
    }
}

/// Split a raw query string into decoded key/value pairs.
///
/// Returns `None` when a percent escape is malformed; the classifier turns
/// that into the Unknown auth type.
pub(crate) fn query_pairs(query: &str) -> Option<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        pairs.push((percent_decode(key)?, percent_decode(value)?));
    }
    Some(pairs)
}

/// Strict percent decoding; `+` decodes to space.
pub(crate) fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 3 > bytes.len() {
                    return None;
                }
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// Locate `needle` inside `haystack`.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("hello").as_deref(), Some("hello"));
        assert_eq!(percent_decode("a%2Fb").as_deref(), Some("a/b"));
        assert_eq!(percent_decode("a+b").as_deref(), Some("a b"));
        assert!(percent_decode("%zz").is_none());
        assert!(percent_decode("%2").is_none());
    }

    #[test]
    fn test_query_pairs() {
        let pairs = query_pairs("a=1&b=two&versions").unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("a".to_string(), "1".to_string()));
        assert_eq!(pairs[2], ("versions".to_string(), String::new()));
        assert!(query_pairs("bad=%GG").is_none());
    }

    #[test]
    fn test_parse_form_repeated_params() {
        let mut req = GatewayRequest::new(Method::GET, "/bucket?tag=a&tag=b".parse().unwrap());
        req.parse_form().unwrap();
        assert_eq!(req.form().unwrap().get("tag").unwrap(), &vec!["a".to_string(), "b".to_string()]);
        assert_eq!(req.query_param("tag"), Some("a"));
    }

    #[tokio::test]
    async fn test_body_read_all() {
        let body = Body::from_bytes(&b"hello world"[..]);
        let bytes = body.read_all(1024).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");

        let body = Body::from_bytes(&b"too large"[..]);
        assert_eq!(body.read_all(4).await.unwrap_err(), ApiError::EntityTooLarge);
    }

    #[tokio::test]
    async fn test_body_stream_roundtrip() {
        let chunks: Vec<io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let body = Body::from_stream(futures::stream::iter(chunks));
        let bytes = body.read_all(16).await.unwrap();
        assert_eq!(&bytes[..], b"abcd");
    }

    #[test]
    fn test_find_subslice() {
        assert_eq!(find_subslice(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subslice(b"abcdef", b"xy"), None);
        assert_eq!(find_subslice(b"ab", b"abcd"), None);
    }
}
