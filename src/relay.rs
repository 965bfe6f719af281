// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The relay engine (C5): one readiness loop per connection driving two
//! half-duplex pipes (client → decode → target, target → encode →
//! client) over four buffers.

use crate::frame::{self, OpCode};
use crate::handshake::{Subprotocol, Version};
use crate::Parsing;
use async_std::net::TcpStream;
use bytes::{Buf, BytesMut};
use futures::future::{self, Either};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::{select, FutureExt};
use std::time::Duration;

/// Allocation block size for a single read syscall.
const BLOCK_SIZE: usize = 8 * 1024;
/// How long the readiness select blocks before giving callers (really,
/// just the next loop iteration) a chance to notice e.g. cancellation.
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// One bidirectional relay between a negotiated websocket client and a
/// plain TCP target.
pub struct Connection<C> {
    client: C,
    target: TcpStream,
    version: Version,
    subprotocol: Subprotocol,
    /// Bytes the handshake reader already pulled off the wire past the
    /// end of the request headers (or the Hixie-76 key3 body) — must be
    /// fed through the decoder before the first live read.
    leading: BytesMut
}

impl<C: AsyncRead + AsyncWrite + Unpin> Connection<C> {
    /// Build a relay from an already-upgraded client transport and a
    /// freshly dialed target socket. `leading` is whatever trailing
    /// bytes the handshake reader had already buffered past the request.
    pub fn new(client: C, target: TcpStream, version: Version, subprotocol: Subprotocol, leading: BytesMut) -> Self {
        Connection { client, target, version, subprotocol, leading }
    }

    /// Drive the relay until either side closes or errors.
    ///
    /// On return (`Ok` or cancellation-driven `Err`), both transports
    /// have been given a best-effort `close()`.
    pub async fn run(self) -> Result<(), Error> {
        let Connection { client, target, version, subprotocol, leading } = self;
        let (mut client_rd, mut client_wr) = client.split();
        let (mut target_rd, mut target_wr) = target.split();

        let mut client_in_raw = leading;
        let mut target_out_decoded = BytesMut::new();
        let mut target_in_raw = BytesMut::new();
        let mut client_out_encoded = BytesMut::new();

        if !client_in_raw.is_empty() && decode_client_frames(version, subprotocol, &mut client_in_raw, &mut target_out_decoded)? {
            let _ = client_wr.close().await;
            let _ = target_wr.close().await;
            return Ok(())
        }

        let result = loop {
            let read_client = target_out_decoded.is_empty();
            let write_client = !client_out_encoded.is_empty();
            let read_target = client_out_encoded.is_empty();
            let write_target = !target_out_decoded.is_empty();

            let mut client_read_buf = [0u8; BLOCK_SIZE];
            let mut target_read_buf = [0u8; BLOCK_SIZE];

            let client_read_fut = maybe(read_client, client_rd.read(&mut client_read_buf));
            let client_write_fut = maybe(write_client, client_wr.write(&client_out_encoded[..]));
            let target_read_fut = maybe(read_target, target_rd.read(&mut target_read_buf));
            let target_write_fut = maybe(write_target, target_wr.write(&target_out_decoded[..]));

            let event = async_std::future::timeout(SELECT_TIMEOUT, async {
                select! {
                    r = client_read_fut.fuse() => Event::ClientRead(r),
                    r = client_write_fut.fuse() => Event::ClientWrite(r),
                    r = target_read_fut.fuse() => Event::TargetRead(r),
                    r = target_write_fut.fuse() => Event::TargetWrite(r),
                }
            })
            .await;

            let event = match event {
                Ok(ev) => ev,
                Err(_elapsed) => continue // TransientReadiness: nothing was ready in time, retry.
            };

            match step(event, version, subprotocol, &client_read_buf, &target_read_buf, &mut client_in_raw, &mut target_out_decoded, &mut target_in_raw, &mut client_out_encoded) {
                Ok(true) => continue,
                Ok(false) => break Ok(()), // orderly close: EOF or close frame
                Err(e) => break Err(e)
            }
        };

        let _ = client_wr.close().await;
        let _ = target_wr.close().await;
        result
    }
}

/// One dispatched readiness event.
enum Event {
    ClientRead(std::io::Result<usize>),
    ClientWrite(std::io::Result<usize>),
    TargetRead(std::io::Result<usize>),
    TargetWrite(std::io::Result<usize>)
}

/// Handle a single readiness event. Returns `Ok(true)` to keep looping,
/// `Ok(false)` on an orderly close, `Err` on anything connection-fatal.
#[allow(clippy::too_many_arguments)]
fn step(
    event: Event,
    version: Version,
    subprotocol: Subprotocol,
    client_read_buf: &[u8],
    target_read_buf: &[u8],
    client_in_raw: &mut BytesMut,
    target_out_decoded: &mut BytesMut,
    target_in_raw: &mut BytesMut,
    client_out_encoded: &mut BytesMut
) -> Result<bool, Error> {
    match event {
        Event::ClientRead(Ok(0)) => Ok(false),
        Event::ClientRead(Ok(n)) => {
            client_in_raw.extend_from_slice(&client_read_buf[.. n]);
            let closed = decode_client_frames(version, subprotocol, client_in_raw, target_out_decoded)?;
            Ok(!closed)
        }
        Event::ClientRead(Err(e)) => Err(e.into()),

        Event::TargetWrite(Ok(0)) => Err(Error::Closed),
        Event::TargetWrite(Ok(n)) => {
            target_out_decoded.advance(n);
            Ok(true)
        }
        Event::TargetWrite(Err(e)) => Err(e.into()),

        Event::TargetRead(Ok(0)) => Ok(false),
        Event::TargetRead(Ok(n)) => {
            target_in_raw.extend_from_slice(&target_read_buf[.. n]);
            encode_to_client(version, subprotocol, target_in_raw, client_out_encoded);
            Ok(true)
        }
        Event::TargetRead(Err(e)) => Err(e.into()),

        Event::ClientWrite(Ok(0)) => Err(Error::Closed),
        Event::ClientWrite(Ok(n)) => {
            client_out_encoded.advance(n);
            Ok(true)
        }
        Event::ClientWrite(Err(e)) => Err(e.into())
    }
}

/// Decode as many complete frames as `raw` currently holds, appending
/// their (possibly Base64-decoded) payload to `out`.
///
/// Returns `true` if a close frame was seen.
fn decode_client_frames(version: Version, subprotocol: Subprotocol, raw: &mut BytesMut, out: &mut BytesMut) -> Result<bool, Error> {
    loop {
        match version {
            Version::HyBi => match frame::hybi::decode(&raw[..])? {
                Parsing::NeedMore => return Ok(false),
                Parsing::Done { value, offset } => {
                    raw.advance(offset);
                    match value.opcode {
                        OpCode::Close => return Ok(true),
                        OpCode::Ping | OpCode::Pong => {}
                        OpCode::Text | OpCode::Binary => append_payload(subprotocol, &value.payload, out)?,
                        OpCode::Continue | OpCode::Reserved(_) => unreachable!("rejected while decoding the frame header")
                    }
                }
            },
            Version::Hixie76 | Version::Hixie75 => match frame::hixie::decode(&raw[..])? {
                Parsing::NeedMore => return Ok(false),
                Parsing::Done { value, offset } => {
                    raw.advance(offset);
                    out.extend_from_slice(&value);
                }
            }
        }
    }
}

fn append_payload(subprotocol: Subprotocol, payload: &[u8], out: &mut BytesMut) -> Result<(), Error> {
    match subprotocol {
        Subprotocol::Base64 => out.extend_from_slice(&crate::base64::decode(payload)?),
        Subprotocol::Binary => out.extend_from_slice(payload)
    }
    Ok(())
}

/// Frame whatever `raw` currently holds into a single outbound message
/// appended to `out`, then drain `raw`.
fn encode_to_client(version: Version, subprotocol: Subprotocol, raw: &mut BytesMut, out: &mut BytesMut) {
    let payload = raw.split();
    match version {
        Version::HyBi => match subprotocol {
            Subprotocol::Base64 => frame::hybi::encode(out, OpCode::Text, crate::base64::encode(&payload).as_bytes()),
            Subprotocol::Binary => frame::hybi::encode(out, OpCode::Binary, &payload)
        },
        Version::Hixie76 | Version::Hixie75 => frame::hixie::encode(out, &payload)
    }
}

/// Build a future that resolves like `fut` when `enabled`, or never
/// resolves otherwise — used to make one arm of a `select!` a no-op
/// without changing its type.
fn maybe<F: std::future::Future>(enabled: bool, fut: F) -> Either<F, future::Pending<F::Output>> {
    if enabled {
        Either::Left(fut)
    } else {
        Either::Right(future::pending())
    }
}

/// Errors which end a relay connection. All are connection-fatal; the
/// listener logs and closes both sockets.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A read or write syscall failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The RFC 6455 frame codec rejected a client frame.
    #[error("hybi frame error: {0}")]
    Hybi(#[from] frame::hybi::Error),
    /// The Hixie frame codec rejected a client frame.
    #[error("hixie frame error: {0}")]
    Hixie(#[from] frame::hixie::Error),
    /// A "base64" subprotocol payload was not valid Base64.
    #[error("base64 error: {0}")]
    Base64(#[from] crate::base64::DecodeError),
    /// A write returned 0 bytes while data remained to be sent.
    #[error("connection closed")]
    Closed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_client_frames_hixie_appends_decoded_bytes() {
        let mut raw = BytesMut::new();
        frame::hixie::encode(&mut raw, b"hello");
        let mut out = BytesMut::new();
        let closed = decode_client_frames(Version::Hixie76, Subprotocol::Base64, &mut raw, &mut out).unwrap();
        assert!(!closed);
        assert_eq!(&out[..], b"hello");
        assert!(raw.is_empty());
    }

    #[test]
    fn decode_client_frames_hybi_binary_subprotocol() {
        let mut framed = BytesMut::new();
        // Hand-roll a masked binary frame carrying "abc".
        framed.extend_from_slice(&[0x82, 0x83, 1, 2, 3, 4]);
        let mut payload = b"abc".to_vec();
        frame::hybi::apply_mask(&mut payload, [1, 2, 3, 4]);
        framed.extend_from_slice(&payload);

        let mut out = BytesMut::new();
        let closed = decode_client_frames(Version::HyBi, Subprotocol::Binary, &mut framed, &mut out).unwrap();
        assert!(!closed);
        assert_eq!(&out[..], b"abc");
    }

    #[test]
    fn decode_client_frames_hybi_close_signals_shutdown() {
        let mut framed = BytesMut::new();
        framed.extend_from_slice(&[0x88, 0x80, 0, 0, 0, 0]); // close, masked, empty payload
        let mut out = BytesMut::new();
        let closed = decode_client_frames(Version::HyBi, Subprotocol::Binary, &mut framed, &mut out).unwrap();
        assert!(closed);
    }

    #[test]
    fn encode_to_client_hybi_base64_wraps_payload() {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(b"hello");
        let mut out = BytesMut::new();
        encode_to_client(Version::HyBi, Subprotocol::Base64, &mut raw, &mut out);
        assert!(raw.is_empty());
        // Text opcode, unmasked, length 8 ("aGVsbG8=").
        assert_eq!(&out[.. 2], &[0x81, 0x08]);
        assert_eq!(&out[2 ..], b"aGVsbG8=");
    }
}
