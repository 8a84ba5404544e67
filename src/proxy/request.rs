use std::fmt;

use axum::body::Body;
use axum::http::uri::Authority;
use axum::http::{header, Method, Request, Response, Uri};
use bytes::Bytes;
use tracing::debug;

const MAX_HEADERS: usize = 64;

pub const RESPONSE_CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const RESPONSE_500: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const RESPONSE_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

/// Error answered to the client before the connection is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailure {
    BadRequest,
    Internal,
    BadGateway,
    Unavailable,
}

impl HttpFailure {
    pub fn response(self) -> &'static [u8] {
        match self {
            HttpFailure::BadRequest => RESPONSE_400,
            HttpFailure::Internal => RESPONSE_500,
            HttpFailure::BadGateway => RESPONSE_502,
            HttpFailure::Unavailable => RESPONSE_503,
        }
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            HttpFailure::BadRequest => 400,
            HttpFailure::Internal => 500,
            HttpFailure::BadGateway => 502,
            HttpFailure::Unavailable => 503,
        };
        write!(f, "HTTP {}", code)
    }
}

impl std::error::Error for HttpFailure {}

/// First request head on a connection, with the routing target worked out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// request-target as sent: authority for CONNECT, path or absolute URI otherwise
    pub target: String,
    pub headers: Vec<(String, String)>,
    /// Lower-case, IPv6 brackets stripped
    pub host: String,
    pub port: u16,
    /// Bytes taken by the head, including the blank line
    pub len: usize,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body length announced by the head. Chunked bodies are not accepted.
    pub fn content_length(&self) -> Result<usize, HttpFailure> {
        if self
            .header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return Err(HttpFailure::BadRequest);
        }
        match self.header("content-length") {
            Some(v) => v.trim().parse().map_err(|_| HttpFailure::BadRequest),
            None => Ok(0),
        }
    }

    /// Rebuild the request for the in-process endpoint router
    pub fn to_local_request(&self, body: Bytes) -> anyhow::Result<Request<Body>> {
        let path = match self.target.parse::<Uri>() {
            Ok(uri) if uri.scheme().is_some() => uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            _ => self.target.clone(),
        };

        let mut builder = Request::builder()
            .method(Method::from_bytes(self.method.as_bytes())?)
            .uri(path);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder.body(Body::from(body))?)
    }
}

/// `Ok(None)` while the head is still incomplete
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, HttpFailure> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            debug!("Unparseable request head: {}", e);
            return Err(HttpFailure::BadRequest);
        }
    };

    let method = req.method.ok_or(HttpFailure::BadRequest)?.to_string();
    let target = req.path.ok_or(HttpFailure::BadRequest)?.to_string();
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    let mut head = RequestHead {
        method,
        target,
        headers,
        host: String::new(),
        port: 0,
        len,
    };

    let (host, port) = if head.is_connect() {
        parse_authority(&head.target, 443)
    } else {
        absolute_target(&head.target).or_else(|| head.header("host").and_then(|h| parse_authority(h, 80)))
    }
    .ok_or(HttpFailure::BadRequest)?;

    head.host = host;
    head.port = port;
    Ok(Some(head))
}

/// `host[:port]`, `[v6][:port]`, optional userinfo
fn parse_authority(value: &str, default_port: u16) -> Option<(String, u16)> {
    let authority: Authority = value.trim().parse().ok()?;
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = match authority.port() {
        Some(p) => p.as_str().parse().ok()?,
        None => default_port,
    };
    Some((host.to_ascii_lowercase(), port))
}

/// Host and port of an absolute-form target (`http://host:port/path`)
fn absolute_target(target: &str) -> Option<(String, u16)> {
    let uri: Uri = target.parse().ok()?;
    let default_port = match uri.scheme_str()? {
        s if s.eq_ignore_ascii_case("https") => 443,
        _ => 80,
    };
    parse_authority(uri.authority()?.as_str(), default_port)
}

/// Serialize an endpoint response for a connection that closes afterwards
pub async fn encode_response(response: Response<Body>) -> anyhow::Result<Vec<u8>> {
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await?;

    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or("")
    );
    for (name, value) in &parts.headers {
        if *name == header::CONTENT_LENGTH || *name == header::CONNECTION || *name == header::TRANSFER_ENCODING {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&body);
    Ok(bytes)
}
