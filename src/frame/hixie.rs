// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Hixie-76/75 framing: `0x00 <base64 payload> 0xFF`.
//!
//! Grounded in `novnc/websockify`'s `wsproxy.c` `decode`/`encode`
//! (base64 branch): scan for the terminating `0xFF`, reject anything
//! between the sentinels that is not in the Base64 alphabet.

use crate::{base64, Parsing};
use bytes::BytesMut;

/// Decode one complete `0x00 ... 0xFF` frame from the front of `buf`.
///
/// If no `0xFF` terminator has arrived yet, returns `NeedMore` and
/// leaves `buf` untouched, exactly like [`crate::frame::hybi::decode`].
pub fn decode(buf: &[u8]) -> Result<Parsing<Vec<u8>>, Error> {
    if buf.is_empty() {
        return Ok(Parsing::NeedMore)
    }
    if buf[0] != 0x00 {
        return Err(Error::MissingFrameStart)
    }

    let terminator = match buf[1 ..].iter().position(|&b| b == 0xFF) {
        Some(i) => i + 1,
        None => return Ok(Parsing::NeedMore)
    };

    let body = &buf[1 .. terminator];
    if !body.iter().all(|&b| is_base64_byte(b)) {
        return Err(Error::InvalidBase64)
    }

    let payload = base64::decode(body).map_err(Error::Base64)?;
    Ok(Parsing::Done { value: payload, offset: terminator + 1 })
}

/// Encode `payload` as `0x00 <base64> 0xFF`.
pub fn encode(buf: &mut BytesMut, payload: &[u8]) {
    let encoded = base64::encode(payload);
    buf.reserve(2 + encoded.len());
    buf.extend_from_slice(&[0x00]);
    buf.extend_from_slice(encoded.as_bytes());
    buf.extend_from_slice(&[0xFF]);
}

fn is_base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}

/// Errors the Hixie frame codec can return.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The frame did not start with `0x00`.
    #[error("missing frame start byte")]
    MissingFrameStart,
    /// A byte between the sentinels was not in `[A-Za-z0-9+/=]`.
    #[error("non-base64 byte in frame body")]
    InvalidBase64,
    /// The body was Base64-alphabet bytes but not a valid encoding.
    #[error("base64 decode error: {0}")]
    Base64(#[source] base64::DecodeError)
}
