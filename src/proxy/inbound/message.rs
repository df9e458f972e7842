//! HTTP/1.x message framing
//!
//! Heads are parsed with `httparse`; bodies are framed by `Content-Length` or
//! kept verbatim in chunked transfer coding so they can be replayed upstream.

use bytes::{Bytes, BytesMut};
use http::uri::{Authority, Uri};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{JunctionError, Result};

/// Upper bound on the size of a message head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 8 * 1024;
/// Default upper bound on a buffered request body
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Response body delimited by connection close
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    /// Minor HTTP version (`0` for HTTP/1.0, `1` for HTTP/1.1)
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl ParsedRequest {
    pub fn version_str(&self) -> &'static str {
        if self.version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// First header value with this name, if it is valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Drop every header whose name starts with `Proxy`
    pub fn strip_proxy_headers(&mut self) {
        self.headers.retain(|(name, _)| {
            !name
                .get(..5)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("proxy"))
        });
    }

    /// Host and optional port the request is addressed to.
    ///
    /// CONNECT targets are authorities; other requests use the absolute URI
    /// and fall back to the `Host` header.
    pub fn target_authority(&self) -> Result<(String, Option<u16>)> {
        if self.is_connect() {
            let authority: Authority = self.target.parse().map_err(|_| {
                JunctionError::Parse(format!("invalid CONNECT target: {}", self.target))
            })?;
            return Ok((authority.host().to_string(), authority.port_u16()));
        }

        let uri: Uri = self
            .target
            .parse()
            .map_err(|_| JunctionError::Parse(format!("invalid request target: {}", self.target)))?;
        if let Some(authority) = uri.authority() {
            return Ok((authority.host().to_string(), authority.port_u16()));
        }

        let host = self
            .header("host")
            .ok_or_else(|| JunctionError::Parse("request has no host".to_string()))?;
        let authority: Authority = host
            .parse()
            .map_err(|_| JunctionError::Parse(format!("invalid Host header: {}", host)))?;
        Ok((authority.host().to_string(), authority.port_u16()))
    }

    /// Absolute URL of a plain HTTP request
    pub fn absolute_url(&self) -> String {
        if self.target.starts_with('/') {
            match self.header("host") {
                Some(host) => format!("http://{}{}", host, self.target),
                None => self.target.clone(),
            }
        } else {
            self.target.clone()
        }
    }

    /// Serialize the request in origin form, as sent to an origin server
    pub fn encode(&self) -> Result<BytesMut> {
        let (path, authority) = if self.target.starts_with('/') || self.target == "*" {
            (self.target.clone(), None)
        } else {
            let uri: Uri = self.target.parse().map_err(|_| {
                JunctionError::Parse(format!("invalid request target: {}", self.target))
            })?;
            let path = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "/".to_string());
            (path, uri.authority().map(|a| a.as_str().to_string()))
        };

        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(self.version_str().as_bytes());
        out.extend_from_slice(b"\r\n");

        if self.header("host").is_none() {
            if let Some(authority) = authority {
                out.extend_from_slice(b"Host: ");
                out.extend_from_slice(authority.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    fn framing(&self) -> Result<BodyFraming> {
        request_framing(&self.headers)
    }
}

/// Parsed status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// How the body following this head is delimited
    pub fn framing(&self, request_was_head: bool) -> Result<BodyFraming> {
        if request_was_head || self.is_interim() || self.status == 204 || self.status == 304 {
            return Ok(BodyFraming::Empty);
        }
        if self.status == 101 {
            return Ok(BodyFraming::UntilClose);
        }
        if is_chunked(&self.headers) {
            return Ok(BodyFraming::Chunked);
        }
        match content_length(&self.headers)? {
            Some(len) => Ok(BodyFraming::Length(len)),
            None => Ok(BodyFraming::UntilClose),
        }
    }
}

fn header_value<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
        .map(str::trim)
}

fn is_chunked(headers: &[(String, Vec<u8>)]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|te| {
            te.rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

fn content_length(headers: &[(String, Vec<u8>)]) -> Result<Option<u64>> {
    match header_value(headers, "content-length") {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| JunctionError::Parse(format!("invalid Content-Length: {}", value))),
        None => Ok(None),
    }
}

fn request_framing(headers: &[(String, Vec<u8>)]) -> Result<BodyFraming> {
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyFraming::Empty,
        Some(len) => BodyFraming::Length(len),
    })
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect()
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let parsed = ParsedRequest {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
                headers: owned_headers(req.headers),
                body: Bytes::new(),
            };
            Ok(Some((parsed, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(JunctionError::Parse(e.to_string())),
    }
}

/// Parse a response head from the start of `buf`, returning it and its length
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = ResponseHead {
                status: resp.code.unwrap_or_default(),
                version: resp.version.unwrap_or(1),
                headers: owned_headers(resp.headers),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(JunctionError::Parse(e.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size { value: u64, digits: usize, ext: bool },
    SizeLf(u64),
    Data(u64),
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    FinalLf,
    Done,
}

/// Incremental scanner over a chunked body.
///
/// It only finds where the body ends; the bytes are forwarded untouched.
#[derive(Debug, Clone)]
pub struct ChunkScanner {
    state: ChunkState,
}

impl Default for ChunkScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkScanner {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size {
                value: 0,
                digits: 0,
                ext: false,
            },
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume bytes of the chunked body, returning how many belong to it.
    ///
    /// Stops right after the terminating CRLF; bytes past it are not consumed.
    pub fn advance(&mut self, input: &[u8]) -> Result<usize> {
        let mut pos = 0;
        while pos < input.len() {
            let byte = input[pos];
            self.state = match self.state {
                ChunkState::Done => return Ok(pos),
                ChunkState::Data(remaining) => {
                    let take = remaining.min((input.len() - pos) as u64);
                    pos += take as usize;
                    let left = remaining - take;
                    self.state = if left == 0 {
                        ChunkState::DataCr
                    } else {
                        ChunkState::Data(left)
                    };
                    continue;
                }
                ChunkState::Size { value, digits, ext } => match byte {
                    b'\r' if digits > 0 => ChunkState::SizeLf(value),
                    b'\r' => return Err(chunk_error("missing chunk size")),
                    _ if ext => ChunkState::Size { value, digits, ext },
                    b';' | b' ' | b'\t' => ChunkState::Size {
                        value,
                        digits,
                        ext: true,
                    },
                    _ => {
                        let digit = (byte as char)
                            .to_digit(16)
                            .ok_or_else(|| chunk_error("invalid chunk size"))?;
                        let value = value
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(digit as u64))
                            .ok_or_else(|| chunk_error("chunk size overflow"))?;
                        ChunkState::Size {
                            value,
                            digits: digits + 1,
                            ext: false,
                        }
                    }
                },
                ChunkState::SizeLf(value) => match byte {
                    b'\n' if value == 0 => ChunkState::TrailerStart,
                    b'\n' => ChunkState::Data(value),
                    _ => return Err(chunk_error("expected LF after chunk size")),
                },
                ChunkState::DataCr => match byte {
                    b'\r' => ChunkState::DataLf,
                    _ => return Err(chunk_error("expected CR after chunk data")),
                },
                ChunkState::DataLf => match byte {
                    b'\n' => ChunkState::Size {
                        value: 0,
                        digits: 0,
                        ext: false,
                    },
                    _ => return Err(chunk_error("expected LF after chunk data")),
                },
                ChunkState::TrailerStart => match byte {
                    b'\r' => ChunkState::FinalLf,
                    _ => ChunkState::TrailerLine,
                },
                ChunkState::TrailerLine => match byte {
                    b'\r' => ChunkState::TrailerLf,
                    _ => ChunkState::TrailerLine,
                },
                ChunkState::TrailerLf => match byte {
                    b'\n' => ChunkState::TrailerStart,
                    _ => return Err(chunk_error("expected LF after trailer")),
                },
                ChunkState::FinalLf => match byte {
                    b'\n' => ChunkState::Done,
                    _ => return Err(chunk_error("expected final LF")),
                },
            };
            pos += 1;
        }
        Ok(pos)
    }
}

fn chunk_error(msg: &str) -> JunctionError {
    JunctionError::Parse(format!("chunked body: {}", msg))
}

/// Reads complete request messages from a byte stream
pub struct MessageReader<R> {
    reader: R,
    buf: BytesMut,
    max_body: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_body: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Requests whose body exceeds `max_body` bytes fail with `Parse`
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Read the next request. `Ok(None)` is a clean EOF between messages.
    pub async fn read_request(&mut self) -> Result<Option<ParsedRequest>> {
        let (mut request, head_len) = loop {
            if !self.buf.is_empty() {
                if let Some(parsed) = parse_request_head(&self.buf)? {
                    break parsed;
                }
                if self.buf.len() > MAX_HEAD_SIZE {
                    return Err(JunctionError::Parse("request head too large".to_string()));
                }
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(JunctionError::Parse(
                    "connection closed mid-message".to_string(),
                ));
            }
        };
        let _ = self.buf.split_to(head_len);

        request.body = match request.framing()? {
            BodyFraming::Empty | BodyFraming::UntilClose => Bytes::new(),
            BodyFraming::Length(len) => {
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= self.max_body)
                    .ok_or_else(|| self.body_too_large())?;
                while self.buf.len() < len {
                    self.fill_or_eof().await?;
                }
                self.buf.split_to(len).freeze()
            }
            BodyFraming::Chunked => {
                let mut scanner = ChunkScanner::new();
                let mut end = 0;
                loop {
                    end += scanner.advance(&self.buf[end..])?;
                    if end > self.max_body {
                        return Err(self.body_too_large());
                    }
                    if scanner.is_done() {
                        break;
                    }
                    self.fill_or_eof().await?;
                }
                self.buf.split_to(end).freeze()
            }
        };

        Ok(Some(request))
    }

    /// Bytes read past the last parsed message
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.reader, self.buf)
    }

    fn body_too_large(&self) -> JunctionError {
        JunctionError::Parse(format!("request body exceeds {} bytes", self.max_body))
    }

    async fn fill(&mut self) -> Result<usize> {
        self.buf.reserve(READ_CHUNK);
        Ok(self.reader.read_buf(&mut self.buf).await?)
    }

    async fn fill_or_eof(&mut self) -> Result<()> {
        if self.fill().await? == 0 {
            return Err(JunctionError::Parse(
                "connection closed mid-body".to_string(),
            ));
        }
        Ok(())
    }
}
