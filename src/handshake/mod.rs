// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Handshake negotiator (C3): detect the pre-handshake probes, parse the
//! HTTP Upgrade request, and decide between Hixie-75, Hixie-76 and HyBi.

pub mod policy;
pub mod server;

use std::fmt;

/// Defined in RFC 6455 and used to generate `Sec-WebSocket-Accept`.
pub(crate) const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The literal Flash cross-domain policy probe (§4.3 / §6).
pub const FLASH_POLICY_REQUEST: &[u8] = b"<policy-file-request/>";

/// The XML body returned in response to [`FLASH_POLICY_REQUEST`].
pub const FLASH_POLICY_RESPONSE: &[u8] =
    b"<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\"/></cross-domain-policy>\n";

/// The monitoring short-circuit path (§4.3).
pub const MONITORING_PATH: &str = "/wsproxy-monitoring/";

/// How many HTTP headers `httparse` is allowed to find before giving up.
pub(crate) const MAX_NUM_HEADERS: usize = 32;

/// Up to how many bytes C3 peeks before it commits to a transport kind.
pub const PEEK_WINDOW: usize = 1024;

/// Which protocol generation a connection negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// The earliest draft: no challenge/response, no subprotocol
    /// negotiation beyond implicit base64 text frames.
    Hixie75,
    /// The MD5 challenge/response draft.
    Hixie76,
    /// RFC 6455.
    HyBi
}

/// The single application-level subprotocol in use on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subprotocol {
    /// Payloads are ASCII Base64 text, decoded before forwarding.
    Base64,
    /// Payloads are forwarded byte-for-byte. Only valid with `HyBi`.
    Binary
}

/// What C3's non-consuming peek found at the front of a freshly accepted
/// socket (§4.3's detection table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lead {
    /// The literal Flash policy probe.
    FlashPolicy,
    /// A TLS record (`0x16` or `0x80` as the first byte).
    Tls,
    /// Plain HTTP.
    Http
}

/// Inspect the first bytes of a connection and decide how to proceed.
///
/// `buf` should hold whatever has been peeked so far (without consuming
/// it from the socket); returns `None` if more bytes are needed to be
/// sure (this only happens while `buf` is shorter than
/// [`FLASH_POLICY_REQUEST`] and doesn't yet disagree with it).
pub fn detect(buf: &[u8]) -> Option<Lead> {
    if buf.is_empty() {
        return None
    }

    match buf[0] {
        0x16 | 0x80 => return Some(Lead::Tls),
        b'<' => {
            let n = buf.len().min(FLASH_POLICY_REQUEST.len());
            if buf[.. n] == FLASH_POLICY_REQUEST[.. n] {
                if buf.len() < FLASH_POLICY_REQUEST.len() {
                    return None
                }
                return Some(Lead::FlashPolicy)
            }
        }
        _ => {}
    }

    Some(Lead::Http)
}

/// Compute the RFC 6455 `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut digest = Sha1::new();
    digest.input(client_key);
    digest.input(ACCEPT_GUID);
    crate::base64::encode(&digest.result())
}

/// Parse a Hixie-76 `Sec-WebSocket-Key{1,2}` header value per the draft
/// rule: `n = (decimal digits in value, as an integer) / (number of
/// spaces in value)`. Confirmed against `wsproxy.c::parsehdrkey`, except
/// that this crate treats `spaces == 0` as an error rather than the
/// original's silent zero (see DESIGN.md).
pub fn parse_hixie_key(value: &[u8]) -> Result<u32, Error> {
    let mut sum: u64 = 0;
    let mut spaces: u32 = 0;
    for &b in value {
        if b.is_ascii_digit() {
            sum = sum * 10 + u64::from(b - b'0');
        } else if b == b' ' {
            spaces += 1;
        }
    }
    if spaces == 0 {
        return Err(Error::InvalidHixieKey)
    }
    Ok((sum / u64::from(spaces)) as u32)
}

/// Compute the Hixie-76 challenge response body: `MD5(be32(key1) ||
/// be32(key2) || key3)`.
pub fn hixie76_response(key1: u32, key2: u32, key3: &[u8; 8]) -> [u8; 16] {
    let mut input = [0u8; 16];
    input[0 .. 4].copy_from_slice(&key1.to_be_bytes());
    input[4 .. 8].copy_from_slice(&key2.to_be_bytes());
    input[8 .. 16].copy_from_slice(key3);
    md5::compute(input).0
}

/// Errors encountered while negotiating the handshake. All are
/// connection-fatal (`ProtocolError`, §7): the handler closes the socket
/// without a status code.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred while reading the request.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The HTTP request could not be parsed at all.
    #[error("malformed http request: {0}")]
    Http(#[source] crate::BoxedError),
    /// The request line was not `GET <path> HTTP/1.1`.
    #[error("invalid request line")]
    InvalidRequestLine,
    /// A required header was absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    /// A header value was present but did not have the expected value.
    #[error("unexpected value for header: {0}")]
    UnexpectedHeaderValue(&'static str),
    /// Neither `base64` nor `binary` was offered (HyBi) or the Hixie
    /// path has no usable subprotocol.
    #[error("no acceptable subprotocol offered")]
    NoAcceptableSubprotocol,
    /// A `Sec-WebSocket-Key{1,2}` header had zero spaces.
    #[error("invalid hixie key header")]
    InvalidHixieKey,
    /// The request path did not match the configured pattern, or named a
    /// port outside the whitelist.
    #[error("target not permitted: {0}")]
    TargetNotPermitted(String),
    /// A raw TCP connection was seen while `--ssl-only` is set.
    #[error("plain connection rejected, TLS required")]
    TlsRequired
}

impl fmt::Display for Lead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Lead::FlashPolicy => f.write_str("flash-policy"),
            Lead::Tls => f.write_str("tls"),
            Lead::Http => f.write_str("http")
        }
    }
}
