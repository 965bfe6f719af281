// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Server-side handshake: parse the client's request, decide the
//! protocol version, and send back the matching response.

use super::{Error, Subprotocol, Version, MAX_NUM_HEADERS, MONITORING_PATH};
use bytes::{Buf, BytesMut};
use futures::prelude::*;

const BLOCK_SIZE: usize = 4096;

/// What the client asked for, once its request line and headers have
/// been fully parsed. The Hixie-76 `key3` body, if any, has also been
/// read by the time this is returned.
#[derive(Debug)]
pub enum ClientRequest {
    /// `GET /wsproxy-monitoring/` — not an upgrade, just a health check.
    Monitoring,
    /// A WebSocket upgrade request.
    Upgrade(Upgrade)
}

/// Everything C5/the listener needs to decide a target and build a
/// response.
#[derive(Debug)]
pub struct Upgrade {
    pub path: String,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub version: Version,
    /// Present for HyBi only.
    pub sec_key: Option<Vec<u8>>,
    /// Present for Hixie-76 only.
    pub key1: Option<u32>,
    pub key2: Option<u32>,
    pub key3: Option<[u8; 8]>,
    /// Subprotocols the client offered, in order (HyBi only; empty for
    /// Hixie, which always implies base64).
    pub protocols: Vec<String>
}

/// The response C3 sends back, built from a [`ClientRequest`] plus the
/// negotiation decisions made by the caller (target, subprotocol, ...).
#[derive(Debug)]
pub enum Response {
    /// `GET /wsproxy-monitoring/` answer.
    Monitoring,
    /// Successful upgrade.
    Accept {
        version: Version,
        subprotocol: Subprotocol,
        origin: String,
        host: String,
        path: String,
        /// Whether this connection is running over TLS, so the Hixie
        /// `WebSocket-Location` header can pick `ws://` vs `wss://`.
        secure: bool,
        /// RFC 6455 `Sec-WebSocket-Accept` value.
        accept_key: Option<String>,
        /// Hixie-76 16-byte MD5 challenge response body.
        md5_body: Option<[u8; 16]>
    },
    /// The request could not be served (bad request, domain/port
    /// rejected by policy). No status code is sent for handshake
    /// errors by default; emitting one is only used for debugging.
    Reject
}

/// Server-side handshake driver over an async socket.
#[derive(Debug)]
pub struct Server<T> {
    socket: T,
    buffer: BytesMut
}

impl<T: AsyncRead + AsyncWrite + Unpin> Server<T> {
    pub fn new(socket: T) -> Self {
        Server { socket, buffer: BytesMut::new() }
    }

    /// Read and parse the client's HTTP request, including the Hixie-76
    /// body bytes if applicable.
    pub async fn receive_request(&mut self) -> Result<ClientRequest, Error> {
        let headers_end = loop {
            if let Some(offset) = find_headers_end(&self.buffer) {
                break offset
            }
            self.fill_buffer().await?;
        };

        let upgrade = parse_request(&self.buffer[.. headers_end])?;

        match upgrade {
            ParsedRequest::Monitoring => {
                self.buffer.advance(headers_end);
                Ok(ClientRequest::Monitoring)
            }
            ParsedRequest::Upgrade(mut u) => {
                if u.version == Version::Hixie76 {
                    while self.buffer.len() < headers_end + 8 {
                        self.fill_buffer().await?;
                    }
                    let mut key3 = [0u8; 8];
                    key3.copy_from_slice(&self.buffer[headers_end .. headers_end + 8]);
                    u.key3 = Some(key3);
                    self.buffer.advance(headers_end + 8);
                } else {
                    self.buffer.advance(headers_end);
                }
                Ok(ClientRequest::Upgrade(u))
            }
        }
    }

    /// Send the negotiated response.
    pub async fn send_response(&mut self, response: &Response) -> Result<(), Error> {
        let mut out = BytesMut::new();
        encode_response(response, &mut out);
        self.socket.write_all(&out).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Give back the underlying socket (and any unconsumed bytes,
    /// re-queued for the relay layer to pick up first).
    pub fn into_parts(self) -> (T, BytesMut) {
        (self.socket, self.buffer)
    }

    async fn fill_buffer(&mut self) -> Result<(), Error> {
        let len = self.buffer.len();
        self.buffer.resize(len + BLOCK_SIZE, 0);
        let n = self.socket.read(&mut self.buffer[len ..]).await?;
        self.buffer.truncate(len + n);
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof during handshake")))
        }
        Ok(())
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

enum ParsedRequest {
    Monitoring,
    Upgrade(Upgrade)
}

fn parse_request(buf: &[u8]) -> Result<ParsedRequest, Error> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
    let mut request = httparse::Request::new(&mut header_buf);

    match request.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::InvalidRequestLine),
        Err(e) => return Err(Error::Http(Box::new(e)))
    }

    if request.method != Some("GET") {
        return Err(Error::InvalidRequestLine)
    }
    let path = request.path.ok_or(Error::InvalidRequestLine)?.to_string();

    if path == MONITORING_PATH {
        return Ok(ParsedRequest::Monitoring)
    }

    let header = |name: &'static str| -> Option<&[u8]> {
        request.headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value)
    };
    let header_str = |name: &'static str| -> Option<String> { header(name).map(|v| String::from_utf8_lossy(v).into_owned()) };

    let host = header_str("Host");
    let origin = header_str("Origin");

    let sec_version = header("Sec-WebSocket-Version");
    let sec_key = header("Sec-WebSocket-Key").map(|v| v.to_vec());
    let key1_raw = header("Sec-WebSocket-Key1");
    let key2_raw = header("Sec-WebSocket-Key2");

    let version = if sec_version.is_some() || sec_key.is_some() {
        Version::HyBi
    } else if key1_raw.is_some() && key2_raw.is_some() {
        Version::Hixie76
    } else {
        Version::Hixie75
    };

    let (key1, key2) = match version {
        Version::Hixie76 => {
            let k1 = super::parse_hixie_key(key1_raw.ok_or(Error::MissingHeader("Sec-WebSocket-Key1"))?)?;
            let k2 = super::parse_hixie_key(key2_raw.ok_or(Error::MissingHeader("Sec-WebSocket-Key2"))?)?;
            (Some(k1), Some(k2))
        }
        _ => (None, None)
    };

    if version == Version::HyBi && sec_key.is_none() {
        return Err(Error::MissingHeader("Sec-WebSocket-Key"))
    }

    let mut protocols = Vec::new();
    for h in request.headers.iter().filter(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Protocol")) {
        let value = std::str::from_utf8(h.value).map_err(|_| Error::InvalidRequestLine)?;
        for p in value.split(',') {
            protocols.push(p.trim().to_string());
        }
    }

    Ok(ParsedRequest::Upgrade(Upgrade { path, host, origin, version, sec_key, key1, key2, key3: None, protocols }))
}

fn encode_response(response: &Response, buf: &mut BytesMut) {
    match response {
        Response::Monitoring => {
            buf.extend_from_slice(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nRUNNING");
        }
        Response::Reject => {
            buf.extend_from_slice(b"HTTP/1.1 400 Bad Request\r\n\r\n");
        }
        Response::Accept { version: Version::HyBi, subprotocol, accept_key, .. } => {
            let proto = match subprotocol {
                Subprotocol::Base64 => "base64",
                Subprotocol::Binary => "binary"
            };
            buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
            buf.extend_from_slice(b"Upgrade: websocket\r\n");
            buf.extend_from_slice(b"Connection: Upgrade\r\n");
            buf.extend_from_slice(b"Sec-WebSocket-Accept: ");
            buf.extend_from_slice(accept_key.as_ref().expect("HyBi accept always carries a key").as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(b"Sec-WebSocket-Protocol: ");
            buf.extend_from_slice(proto.as_bytes());
            buf.extend_from_slice(b"\r\n\r\n");
        }
        Response::Accept { version: Version::Hixie76, origin, host, path, secure, md5_body, .. } => {
            buf.extend_from_slice(b"HTTP/1.1 101 WebSocket Protocol Handshake\r\n");
            buf.extend_from_slice(b"Upgrade: WebSocket\r\nConnection: Upgrade\r\n");
            buf.extend_from_slice(b"Sec-WebSocket-Origin: ");
            buf.extend_from_slice(origin.as_bytes());
            buf.extend_from_slice(b"\r\nSec-WebSocket-Location: ");
            buf.extend_from_slice(if *secure { b"wss://" } else { b"ws://" });
            buf.extend_from_slice(host.as_bytes());
            buf.extend_from_slice(path.as_bytes());
            buf.extend_from_slice(b"\r\nSec-WebSocket-Protocol: base64\r\n\r\n");
            buf.extend_from_slice(md5_body.as_ref().expect("Hixie-76 accept always carries an MD5 body"));
        }
        Response::Accept { version: Version::Hixie75, origin, host, path, secure, .. } => {
            buf.extend_from_slice(b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n");
            buf.extend_from_slice(b"Upgrade: WebSocket\r\nConnection: Upgrade\r\n");
            buf.extend_from_slice(b"WebSocket-Origin: ");
            buf.extend_from_slice(origin.as_bytes());
            buf.extend_from_slice(b"\r\nWebSocket-Location: ");
            buf.extend_from_slice(if *secure { b"wss://" } else { b"ws://" });
            buf.extend_from_slice(host.as_bytes());
            buf.extend_from_slice(path.as_bytes());
            buf.extend_from_slice(b"\r\n\r\n");
        }
    }
}

