//! HTTP/1.1 message framing for both sides of the proxy.
//!
//! Connections exchange decoded frames rather than raw bytes: a head frame,
//! zero or more body chunk frames, and an end-of-message marker. The relay
//! forwards these frames between the client-facing and remote-facing
//! connections, so framing differences (chunked vs. content-length vs.
//! EOF-delimited) never leak across the pairing.

use crate::error::ProxyError;
use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::collections::VecDeque;
use tokio_util::codec::{Decoder, Encoder};

/// Cap on the size of a head block, matching the 16 KiB limit the listener
/// advertises nowhere but enforces everywhere.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_CHUNK_LINE: usize = 256;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

/// One decoded HTTP message element.
#[derive(Debug, Clone)]
pub enum HttpFrame {
    RequestHead(RequestHead),
    ResponseHead(ResponseHead),
    /// A slice of message body. Owned by whoever holds the frame.
    Chunk(Bytes),
    /// End of the current message; the next frame starts a new exchange.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadState {
    Head,
    /// Body finished; emit `End` on the next decode call.
    EmitEnd,
    Fixed(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkCrlf,
    ChunkTrailer,
    /// Response body delimited by connection close.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WriteMode {
    Idle,
    Raw,
    Chunked,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProxyError> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| ProxyError::Http("invalid Content-Length".to_string())),
    }
}

/// Statuses that never carry a body regardless of framing headers.
fn bodyless_status(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn parse_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ProxyError> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| ProxyError::Http(format!("bad header name: {}", e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| ProxyError::Http(format!("bad header value: {}", e)))?;
        map.append(name, value);
    }
    Ok(map)
}

fn write_head_common(dst: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Shared body-decoding state machine. Returns `Ok(None)` when more input is
/// needed; the head states are handled by each codec separately.
fn decode_body(state: &mut ReadState, src: &mut BytesMut) -> Result<Option<HttpFrame>, ProxyError> {
    loop {
        match *state {
            ReadState::Head => return Ok(None),
            ReadState::EmitEnd => {
                *state = ReadState::Head;
                return Ok(Some(HttpFrame::End));
            }
            ReadState::Fixed(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = src.len().min(remaining as usize);
                let chunk = src.split_to(take).freeze();
                let left = remaining - take as u64;
                *state = if left == 0 {
                    ReadState::EmitEnd
                } else {
                    ReadState::Fixed(left)
                };
                return Ok(Some(HttpFrame::Chunk(chunk)));
            }
            ReadState::ChunkSize => {
                let Some(pos) = find_crlf(&src[..]) else {
                    if src.len() > MAX_CHUNK_LINE {
                        return Err(ProxyError::Http("chunk size line too long".to_string()));
                    }
                    return Ok(None);
                };
                let line = std::str::from_utf8(&src[..pos])
                    .map_err(|_| ProxyError::Http("invalid chunk size line".to_string()))?;
                let digits = line.split(';').next().unwrap_or("").trim();
                let size = u64::from_str_radix(digits, 16)
                    .map_err(|_| ProxyError::Http(format!("invalid chunk size: {}", digits)))?;
                src.advance(pos + 2);
                *state = if size == 0 {
                    ReadState::ChunkTrailer
                } else {
                    ReadState::ChunkData(size)
                };
            }
            ReadState::ChunkData(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = src.len().min(remaining as usize);
                let chunk = src.split_to(take).freeze();
                let left = remaining - take as u64;
                *state = if left == 0 {
                    ReadState::ChunkCrlf
                } else {
                    ReadState::ChunkData(left)
                };
                return Ok(Some(HttpFrame::Chunk(chunk)));
            }
            ReadState::ChunkCrlf => {
                if src.len() < 2 {
                    return Ok(None);
                }
                src.advance(2);
                *state = ReadState::ChunkSize;
            }
            ReadState::ChunkTrailer => {
                let Some(pos) = find_crlf(&src[..]) else {
                    if src.len() > MAX_HEADER_BYTES {
                        return Err(ProxyError::Http("chunk trailer too long".to_string()));
                    }
                    return Ok(None);
                };
                let empty = pos == 0;
                src.advance(pos + 2);
                if empty {
                    *state = ReadState::EmitEnd;
                }
            }
            ReadState::Eof => {
                if src.is_empty() {
                    return Ok(None);
                }
                let chunk = src.split_to(src.len()).freeze();
                return Ok(Some(HttpFrame::Chunk(chunk)));
            }
        }
    }
}

fn body_write_mode(headers: &HeaderMap) -> Result<WriteMode, ProxyError> {
    if is_chunked(headers) {
        return Ok(WriteMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(WriteMode::Idle),
        Some(_) => Ok(WriteMode::Raw),
    }
}

fn encode_body_frame(
    mode: &mut WriteMode,
    frame: HttpFrame,
    dst: &mut BytesMut,
) -> Result<(), ProxyError> {
    match frame {
        HttpFrame::Chunk(data) => match *mode {
            WriteMode::Raw => dst.extend_from_slice(&data),
            WriteMode::Chunked => {
                if !data.is_empty() {
                    dst.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
                    dst.extend_from_slice(&data);
                    dst.extend_from_slice(b"\r\n");
                }
            }
            WriteMode::Idle => {}
        },
        HttpFrame::End => {
            if *mode == WriteMode::Chunked {
                dst.extend_from_slice(b"0\r\n\r\n");
            }
            *mode = WriteMode::Idle;
        }
        _ => return Err(ProxyError::Http("head frame inside message body".to_string())),
    }
    Ok(())
}

/// Codec for the client-facing connection: decodes requests, encodes
/// responses.
pub struct ServerCodec {
    read_state: ReadState,
    write_mode: WriteMode,
}

impl ServerCodec {
    pub fn new() -> Self {
        Self {
            read_state: ReadState::Head,
            write_mode: WriteMode::Idle,
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ServerCodec {
    type Item = HttpFrame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpFrame>, ProxyError> {
        if self.read_state != ReadState::Head {
            return decode_body(&mut self.read_state, src);
        }

        // Tolerate stray blank lines between pipelined requests.
        while src.first().map_or(false, |b| *b == b'\r' || *b == b'\n') {
            src.advance(1);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let (head, consumed) = match parsed
            .parse(&src[..])
            .map_err(|e| ProxyError::Http(format!("bad request head: {}", e)))?
        {
            httparse::Status::Partial => {
                if src.len() > MAX_HEADER_BYTES {
                    return Err(ProxyError::Http("request head too large".to_string()));
                }
                return Ok(None);
            }
            httparse::Status::Complete(len) => {
                let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
                    .map_err(|e| ProxyError::Http(format!("bad method: {}", e)))?;
                let uri: Uri = parsed
                    .path
                    .unwrap_or("")
                    .parse()
                    .map_err(|e| ProxyError::Http(format!("bad request URI: {}", e)))?;
                let version = if parsed.version == Some(0) {
                    Version::HTTP_10
                } else {
                    Version::HTTP_11
                };
                let headers = parse_headers(parsed.headers)?;
                (
                    RequestHead {
                        method,
                        uri,
                        version,
                        headers,
                    },
                    len,
                )
            }
        };
        src.advance(consumed);

        self.read_state = if head.method == Method::CONNECT {
            // CONNECT carries no body; the connection turns into a raw
            // tunnel after the response.
            ReadState::EmitEnd
        } else if is_chunked(&head.headers) {
            ReadState::ChunkSize
        } else {
            match content_length(&head.headers)? {
                Some(n) if n > 0 => ReadState::Fixed(n),
                _ => ReadState::EmitEnd,
            }
        };
        Ok(Some(HttpFrame::RequestHead(head)))
    }
}

impl Encoder<HttpFrame> for ServerCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: HttpFrame, dst: &mut BytesMut) -> Result<(), ProxyError> {
        match frame {
            HttpFrame::ResponseHead(mut head) => {
                self.write_mode = if bodyless_status(head.status) {
                    WriteMode::Idle
                } else if is_chunked(&head.headers) {
                    WriteMode::Chunked
                } else {
                    match content_length(&head.headers)? {
                        Some(0) => WriteMode::Idle,
                        Some(_) => WriteMode::Raw,
                        None => {
                            // EOF-delimited origin body; re-frame as chunked
                            // so the kept-alive client sees message bounds.
                            head.headers.insert(
                                TRANSFER_ENCODING,
                                HeaderValue::from_static("chunked"),
                            );
                            WriteMode::Chunked
                        }
                    }
                };
                dst.extend_from_slice(version_str(head.version).as_bytes());
                dst.extend_from_slice(
                    format!(
                        " {} {}\r\n",
                        head.status.as_u16(),
                        head.status.canonical_reason().unwrap_or("")
                    )
                    .as_bytes(),
                );
                write_head_common(dst, &head.headers);
                Ok(())
            }
            other => encode_body_frame(&mut self.write_mode, other, dst),
        }
    }
}

/// Codec for the remote-facing connection: encodes requests, decodes
/// responses. Tracks in-flight request methods so responses to HEAD and
/// CONNECT are framed as bodyless.
pub struct ClientCodec {
    read_state: ReadState,
    write_mode: WriteMode,
    pending: VecDeque<Method>,
    eof_terminated: bool,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self {
            read_state: ReadState::Head,
            write_mode: WriteMode::Idle,
            pending: VecDeque::new(),
            eof_terminated: false,
        }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<HttpFrame> for ClientCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: HttpFrame, dst: &mut BytesMut) -> Result<(), ProxyError> {
        match frame {
            HttpFrame::RequestHead(head) => {
                self.write_mode = body_write_mode(&head.headers)?;
                self.pending.push_back(head.method.clone());
                dst.extend_from_slice(
                    format!(
                        "{} {} {}\r\n",
                        head.method,
                        head.uri,
                        version_str(head.version)
                    )
                    .as_bytes(),
                );
                write_head_common(dst, &head.headers);
                Ok(())
            }
            other => encode_body_frame(&mut self.write_mode, other, dst),
        }
    }
}

impl Decoder for ClientCodec {
    type Item = HttpFrame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpFrame>, ProxyError> {
        if self.read_state != ReadState::Head {
            return decode_body(&mut self.read_state, src);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        let (head, consumed) = match parsed
            .parse(&src[..])
            .map_err(|e| ProxyError::Http(format!("bad response head: {}", e)))?
        {
            httparse::Status::Partial => {
                if src.len() > MAX_HEADER_BYTES {
                    return Err(ProxyError::Http("response head too large".to_string()));
                }
                return Ok(None);
            }
            httparse::Status::Complete(len) => {
                let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                    .map_err(|e| ProxyError::Http(format!("bad status: {}", e)))?;
                let version = if parsed.version == Some(0) {
                    Version::HTTP_10
                } else {
                    Version::HTTP_11
                };
                let headers = parse_headers(parsed.headers)?;
                (
                    ResponseHead {
                        status,
                        version,
                        headers,
                    },
                    len,
                )
            }
        };
        src.advance(consumed);

        let informational = head.status.is_informational();
        let request_method = if informational {
            // 1xx precedes the real response; keep the method queued.
            self.pending.front().cloned()
        } else {
            self.pending.pop_front()
        };
        let head_like = matches!(request_method, Some(Method::HEAD) | Some(Method::CONNECT));

        self.read_state = if informational || head_like || bodyless_status(head.status) {
            ReadState::EmitEnd
        } else if is_chunked(&head.headers) {
            ReadState::ChunkSize
        } else {
            match content_length(&head.headers)? {
                Some(0) => ReadState::EmitEnd,
                Some(n) => ReadState::Fixed(n),
                None => ReadState::Eof,
            }
        };
        Ok(Some(HttpFrame::ResponseHead(head)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<HttpFrame>, ProxyError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.read_state {
            // Connection close is the legitimate terminator here.
            ReadState::Eof if !self.eof_terminated => {
                self.eof_terminated = true;
                self.read_state = ReadState::Head;
                Ok(Some(HttpFrame::End))
            }
            ReadState::Head if src.is_empty() => Ok(None),
            ReadState::Eof => Ok(None),
            _ => Err(ProxyError::Http(
                "remote closed mid-message".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all<D: Decoder<Item = HttpFrame, Error = ProxyError>>(
        codec: &mut D,
        input: &[u8],
    ) -> Vec<HttpFrame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_simple_get() {
        let mut codec = ServerCodec::new();
        let frames = decode_all(
            &mut codec,
            b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n",
        );
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            HttpFrame::RequestHead(head) => {
                assert_eq!(head.method, Method::GET);
                assert_eq!(head.uri.host(), Some("example.com"));
                assert_eq!(head.headers.get("user-agent").unwrap(), "test");
            }
            other => panic!("expected request head, got {:?}", other),
        }
        assert!(matches!(frames[1], HttpFrame::End));
    }

    #[test]
    fn test_decode_request_body_across_feeds() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"POST /submit HTTP/1.1\r\nContent-Length: 10\r\n\r\nhell");

        let mut frames = Vec::new();
        while let Some(f) = codec.decode(&mut buf).unwrap() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 2); // head + first chunk

        buf.extend_from_slice(b"o world");
        while let Some(f) = codec.decode(&mut buf).unwrap() {
            frames.push(f);
        }
        let body: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                HttpFrame::Chunk(c) => Some(c.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"hello worl"); // 10 bytes, trailing "d" belongs to nothing
        assert!(matches!(frames.last(), Some(HttpFrame::End)));
    }

    #[test]
    fn test_decode_chunked_response() {
        let mut codec = ClientCodec::new();
        let mut out = BytesMut::new();
        let head = RequestHead {
            method: Method::GET,
            uri: "/".parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        };
        codec.encode(HttpFrame::RequestHead(head), &mut out).unwrap();
        codec.encode(HttpFrame::End, &mut out).unwrap();

        let frames = decode_all(
            &mut codec,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        match &frames[0] {
            HttpFrame::ResponseHead(head) => assert_eq!(head.status, StatusCode::OK),
            other => panic!("expected response head, got {:?}", other),
        }
        let body: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                HttpFrame::Chunk(c) => Some(c.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"wikipedia");
        assert!(matches!(frames.last(), Some(HttpFrame::End)));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut codec = ClientCodec::new();
        let mut out = BytesMut::new();
        let head = RequestHead {
            method: Method::HEAD,
            uri: "/".parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        };
        codec.encode(HttpFrame::RequestHead(head), &mut out).unwrap();
        codec.encode(HttpFrame::End, &mut out).unwrap();

        let frames = decode_all(
            &mut codec,
            b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n",
        );
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], HttpFrame::End));
    }

    #[test]
    fn test_eof_delimited_response() {
        let mut codec = ClientCodec::new();
        let mut out = BytesMut::new();
        let head = RequestHead {
            method: Method::GET,
            uri: "/".parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        };
        codec.encode(HttpFrame::RequestHead(head), &mut out).unwrap();
        codec.encode(HttpFrame::End, &mut out).unwrap();

        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\nold-style body"[..]);
        let mut frames = Vec::new();
        while let Some(f) = codec.decode(&mut buf).unwrap() {
            frames.push(f);
        }
        // Connection close delivers the End marker.
        while let Some(f) = codec.decode_eof(&mut buf).unwrap() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames.last(), Some(HttpFrame::End)));
    }

    #[test]
    fn test_encode_response_reframes_eof_body_as_chunked() {
        let mut codec = ServerCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(
                HttpFrame::ResponseHead(ResponseHead::new(StatusCode::OK)),
                &mut dst,
            )
            .unwrap();
        codec
            .encode(HttpFrame::Chunk(Bytes::from_static(b"data")), &mut dst)
            .unwrap();
        codec.encode(HttpFrame::End, &mut dst).unwrap();

        let raw = String::from_utf8(dst.to_vec()).unwrap();
        assert!(raw.contains("transfer-encoding: chunked"));
        assert!(raw.ends_with("4\r\ndata\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_encode_response_with_content_length_is_raw() {
        let mut codec = ServerCodec::new();
        let mut dst = BytesMut::new();
        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("4"));
        codec.encode(HttpFrame::ResponseHead(head), &mut dst).unwrap();
        codec
            .encode(HttpFrame::Chunk(Bytes::from_static(b"data")), &mut dst)
            .unwrap();
        codec.encode(HttpFrame::End, &mut dst).unwrap();

        let raw = String::from_utf8(dst.to_vec()).unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.ends_with("\r\n\r\ndata"));
    }

    #[test]
    fn test_oversized_head_rejected() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\nX-Filler: ");
        buf.extend_from_slice(&vec![b'a'; MAX_HEADER_BYTES + 1]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_connect_request_is_bodyless() {
        let mut codec = ServerCodec::new();
        let frames = decode_all(
            &mut codec,
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
        );
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            HttpFrame::RequestHead(head) => {
                assert_eq!(head.method, Method::CONNECT);
                assert_eq!(head.uri.port_u16(), Some(443));
            }
            other => panic!("expected request head, got {:?}", other),
        }
    }
}
