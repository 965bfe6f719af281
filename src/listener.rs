// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Listener dispatcher (C6): accept loop, per-connection task spawn,
//! and the glue between C3 (handshake), C4 (TLS) and C5 (relay).

use crate::config::ListenerConfig;
use crate::handshake::{self, server::{ClientRequest, Response, Server, Upgrade}, Lead, Subprotocol, Version};
use crate::relay;
use crate::tls::{self, Transport};
use async_std::net::{TcpListener, TcpStream};
use async_std::prelude::*;
use async_std::task;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Up to how many bytes are peeked before C3 commits to a [`Lead`].
const PEEK_GROWTH: usize = 256;

/// Accept connections until `shutdown` is requested, spawning one task
/// per connection and waiting for all in-flight tasks to finish before
/// returning — the "stop accepting, then drain" half of graceful
/// termination.
pub async fn run(config: Arc<ListenerConfig>, acceptor: Option<tls::Acceptor>, shutdown: Arc<AtomicBool>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let mut incoming = listener.incoming();
    let mut handles = Vec::new();

    while !shutdown.load(Ordering::Relaxed) {
        let socket = match incoming.next().await {
            Some(Ok(s)) => s,
            Some(Err(e)) => {
                log::warn!("accept error: {}", e);
                continue
            }
            None => break
        };

        let config = config.clone();
        let acceptor = acceptor.clone();
        let peer = socket.peer_addr().ok();
        handles.push(task::spawn(async move {
            if let Err(e) = handle_connection(socket, config, acceptor).await {
                log::warn!("connection {:?} ended with an error: {}", peer, e);
            }
        }));
    }

    for h in handles {
        h.await;
    }
    Ok(())
}

async fn handle_connection(socket: TcpStream, config: Arc<ListenerConfig>, acceptor: Option<tls::Acceptor>) -> Result<(), Error> {
    let lead = peek_lead(&socket).await?;

    match lead {
        Lead::FlashPolicy => {
            consume_flash_probe(socket).await?;
            Ok(())
        }
        Lead::Tls => {
            let acceptor = acceptor.as_ref().ok_or(Error::TlsNotConfigured)?;
            let tls_stream = acceptor.accept(socket).await?;
            negotiate_and_relay(Transport::Tls(tls_stream), &config, true).await
        }
        Lead::Http => {
            if config.ssl_only {
                return Err(Error::Handshake(handshake::Error::TlsRequired))
            }
            negotiate_and_relay(Transport::Plain(socket), &config, false).await
        }
    }
}

/// Peek (non-destructively) the front of the socket until C3 can decide
/// what kind of connection this is.
async fn peek_lead(socket: &TcpStream) -> Result<Lead, Error> {
    let mut size = PEEK_GROWTH.min(handshake::PEEK_WINDOW);
    loop {
        let mut buf = vec![0u8; size];
        let n = socket.peek(&mut buf).await?;
        buf.truncate(n);
        if let Some(lead) = handshake::detect(&buf) {
            return Ok(lead)
        }
        if size >= handshake::PEEK_WINDOW {
            return Err(Error::Handshake(handshake::Error::InvalidRequestLine))
        }
        size = (size * 2).min(handshake::PEEK_WINDOW);
    }
}

async fn consume_flash_probe(mut socket: TcpStream) -> Result<(), Error> {
    let mut buf = vec![0u8; handshake::FLASH_POLICY_REQUEST.len()];
    socket.read_exact(&mut buf).await?;
    socket.write_all(handshake::FLASH_POLICY_RESPONSE).await?;
    socket.flush().await?;
    Ok(())
}

async fn negotiate_and_relay<T>(transport: T, config: &ListenerConfig, secure: bool) -> Result<(), Error>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin
{
    let mut server = Server::new(transport);
    let request = server.receive_request().await?;

    let upgrade = match request {
        ClientRequest::Monitoring => {
            server.send_response(&Response::Monitoring).await?;
            return Ok(())
        }
        ClientRequest::Upgrade(u) => u
    };

    let response = match build_response(&upgrade, config, secure) {
        Ok(r) => r,
        Err(e) => {
            server.send_response(&Response::Reject).await?;
            return Err(Error::Handshake(e))
        }
    };

    let subprotocol = match &response {
        Response::Accept { subprotocol, .. } => *subprotocol,
        _ => unreachable!("build_response only returns Accept or an error")
    };

    let target_port = resolve_target_port(&upgrade, config)?;
    let target = TcpStream::connect((config.target_host.as_str(), target_port)).await?;

    server.send_response(&response).await?;
    let (transport, leading) = server.into_parts();

    relay::Connection::new(transport, target, upgrade.version, subprotocol, leading).run().await?;
    Ok(())
}

fn build_response(upgrade: &Upgrade, config: &ListenerConfig, secure: bool) -> Result<Response, handshake::Error> {
    let subprotocol = negotiate_subprotocol(upgrade.version, &upgrade.protocols)?;

    let origin = upgrade.origin.clone().unwrap_or_default();
    let host = upgrade.host.clone().unwrap_or_default();
    let path = upgrade.path.clone();

    match upgrade.version {
        Version::HyBi => {
            let sec_key = upgrade.sec_key.as_deref().ok_or(handshake::Error::MissingHeader("Sec-WebSocket-Key"))?;
            let accept_key = handshake::accept_key(sec_key);
            Ok(Response::Accept { version: Version::HyBi, subprotocol, origin, host, path, secure, accept_key: Some(accept_key), md5_body: None })
        }
        Version::Hixie76 => {
            let key1 = upgrade.key1.ok_or(handshake::Error::MissingHeader("Sec-WebSocket-Key1"))?;
            let key2 = upgrade.key2.ok_or(handshake::Error::MissingHeader("Sec-WebSocket-Key2"))?;
            let key3 = upgrade.key3.ok_or(handshake::Error::MissingHeader("key3 body"))?;
            let md5_body = handshake::hixie76_response(key1, key2, &key3);
            Ok(Response::Accept { version: Version::Hixie76, subprotocol, origin, host, path, secure, accept_key: None, md5_body: Some(md5_body) })
        }
        Version::Hixie75 => Ok(Response::Accept { version: Version::Hixie75, subprotocol, origin, host, path, secure, accept_key: None, md5_body: None })
    }
}

/// §4.3: prefer `base64`, fall back to `binary`, reject otherwise. Hixie
/// never offers a protocol list and always implies `base64`.
fn negotiate_subprotocol(version: Version, offered: &[String]) -> Result<Subprotocol, handshake::Error> {
    match version {
        Version::Hixie75 | Version::Hixie76 => Ok(Subprotocol::Base64),
        Version::HyBi => {
            if offered.iter().any(|p| p == "base64") {
                Ok(Subprotocol::Base64)
            } else if offered.iter().any(|p| p == "binary") {
                Ok(Subprotocol::Binary)
            } else {
                Err(handshake::Error::NoAcceptableSubprotocol)
            }
        }
    }
}

fn resolve_target_port(upgrade: &Upgrade, config: &ListenerConfig) -> Result<u16, Error> {
    if let Some(port) = config.target_port {
        return Ok(port)
    }
    let port = config.pattern.extract_port(&upgrade.path).ok_or_else(|| Error::Handshake(handshake::Error::TargetNotPermitted(upgrade.path.clone())))?;
    if !config.whitelist.allows(port) {
        return Err(Error::Handshake(handshake::Error::TargetNotPermitted(upgrade.path.clone())))
    }
    Ok(port)
}

/// Errors raised while servicing one accepted connection. All are
/// connection-fatal; the caller logs and moves on to the next accept.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake error: {0}")]
    Handshake(#[from] handshake::Error),
    #[error("relay error: {0}")]
    Relay(#[from] relay::Error),
    #[error("tls connection seen but no certificate/key was configured")]
    TlsNotConfigured,
    #[error("tls error: {0}")]
    Tls(#[from] tls::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_prefers_base64_over_binary() {
        let offered = vec!["binary".to_string(), "base64".to_string()];
        assert_eq!(negotiate_subprotocol(Version::HyBi, &offered).unwrap(), Subprotocol::Base64);
    }

    #[test]
    fn negotiate_falls_back_to_binary() {
        let offered = vec!["binary".to_string()];
        assert_eq!(negotiate_subprotocol(Version::HyBi, &offered).unwrap(), Subprotocol::Binary);
    }

    #[test]
    fn negotiate_rejects_unknown_protocols() {
        let offered = vec!["xmpp".to_string()];
        assert_matches::assert_matches!(negotiate_subprotocol(Version::HyBi, &offered), Err(handshake::Error::NoAcceptableSubprotocol));
    }

    #[test]
    fn hixie_always_negotiates_base64() {
        assert_eq!(negotiate_subprotocol(Version::Hixie76, &[]).unwrap(), Subprotocol::Base64);
    }

    // End-to-end scenarios from spec §8 (E1-E6), driven over real loopback
    // sockets via `handle_connection` directly (the accept loop in `run`
    // adds nothing these tests need to exercise).

    use crate::handshake::policy::{PathPattern, PortWhitelist};
    use std::time::Duration;

    fn test_config(target_addr: std::net::SocketAddr) -> ListenerConfig {
        ListenerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            target_host: target_addr.ip().to_string(),
            target_port: Some(target_addr.port()),
            cert: None,
            key: None,
            ssl_only: false,
            whitelist: PortWhitelist::default(),
            pattern: PathPattern::default(),
            daemon: false,
            verbosity: 0
        }
    }

    async fn with_timeout<F: std::future::Future>(fut: F) -> F::Output {
        async_std::future::timeout(Duration::from_secs(5), fut).await.expect("test timed out")
    }

    #[async_std::test]
    async fn e1_flash_policy_probe() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let config = Arc::new(test_config(target_listener.local_addr().unwrap()));

        task::spawn(async move {
            let (socket, _) = server_listener.accept().await.unwrap();
            let _ = handle_connection(socket, config, None).await;
        });

        let mut client = with_timeout(TcpStream::connect(server_addr)).await.unwrap();
        with_timeout(client.write_all(handshake::FLASH_POLICY_REQUEST)).await.unwrap();

        let mut response = Vec::new();
        with_timeout(client.read_to_end(&mut response)).await.unwrap();
        assert_eq!(response, handshake::FLASH_POLICY_RESPONSE);
    }

    #[async_std::test]
    async fn e2_hybi_happy_path_binary() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        task::spawn(async move {
            let (mut target, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            target.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            target.write_all(b"world").await.unwrap();
            target.flush().await.unwrap();
        });

        let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let config = Arc::new(test_config(target_addr));
        task::spawn(async move {
            let (socket, _) = server_listener.accept().await.unwrap();
            let _ = handle_connection(socket, config, None).await;
        });

        let mut client = with_timeout(TcpStream::connect(server_addr)).await.unwrap();
        let request = "GET / HTTP/1.1\r\n\
                        Host: localhost\r\n\
                        Upgrade: websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                        Sec-WebSocket-Version: 13\r\n\
                        Sec-WebSocket-Protocol: binary\r\n\r\n";
        with_timeout(client.write_all(request.as_bytes())).await.unwrap();

        let response = with_timeout(read_http_headers(&mut client)).await;
        assert!(response.contains("101 Switching Protocols"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response.contains("Sec-WebSocket-Protocol: binary"));

        let mut frame = vec![0x82, 0x80 | 5, 1, 2, 3, 4];
        let mut payload = b"hello".to_vec();
        crate::frame::hybi::apply_mask(&mut payload, [1, 2, 3, 4]);
        frame.extend_from_slice(&payload);
        with_timeout(client.write_all(&frame)).await.unwrap();

        let mut header = [0u8; 2];
        with_timeout(client.read_exact(&mut header)).await.unwrap();
        assert_eq!(header[0], 0x82, "expected an unmasked binary frame");
        let len = (header[1] & 0x7F) as usize;
        let mut payload = vec![0u8; len];
        with_timeout(client.read_exact(&mut payload)).await.unwrap();
        assert_eq!(payload, b"world");
    }

    #[async_std::test]
    async fn e3_hybi_base64_subprotocol() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        task::spawn(async move {
            let (mut target, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            target.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        });

        let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let config = Arc::new(test_config(target_addr));
        task::spawn(async move {
            let (socket, _) = server_listener.accept().await.unwrap();
            let _ = handle_connection(socket, config, None).await;
        });

        let mut client = with_timeout(TcpStream::connect(server_addr)).await.unwrap();
        let request = "GET / HTTP/1.1\r\n\
                        Host: localhost\r\n\
                        Upgrade: websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                        Sec-WebSocket-Version: 13\r\n\
                        Sec-WebSocket-Protocol: base64\r\n\r\n";
        with_timeout(client.write_all(request.as_bytes())).await.unwrap();
        let response = with_timeout(read_http_headers(&mut client)).await;
        assert!(response.contains("Sec-WebSocket-Protocol: base64"));

        // Text frame carrying the ASCII base64 encoding of "hello".
        let mut frame = vec![0x81, 0x80 | 8, 9, 9, 9, 9];
        let mut payload = b"aGVsbG8=".to_vec();
        crate::frame::hybi::apply_mask(&mut payload, [9, 9, 9, 9]);
        frame.extend_from_slice(&payload);
        with_timeout(client.write_all(&frame)).await.unwrap();
    }

    #[async_std::test]
    async fn e4_hixie76_md5_response() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        task::spawn(async move {
            let _ = target_listener.accept().await;
        });

        let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let config = Arc::new(test_config(target_addr));
        task::spawn(async move {
            let (socket, _) = server_listener.accept().await.unwrap();
            let _ = handle_connection(socket, config, None).await;
        });

        let mut client = with_timeout(TcpStream::connect(server_addr)).await.unwrap();
        let request = "GET / HTTP/1.1\r\n\
                        Host: localhost\r\n\
                        Connection: Upgrade\r\n\
                        Upgrade: WebSocket\r\n\
                        Sec-WebSocket-Key1: 18x 6]8vM;54 *(5: { U1]8 0\r\n\
                        Sec-WebSocket-Key2: 1_ tx7X d < nw 334J702) 7]o} 8\r\n\r\n\
                        Tm5ib3R-";
        with_timeout(client.write_all(request.as_bytes())).await.unwrap();

        let header_text = with_timeout(read_http_headers(&mut client)).await;
        assert!(header_text.contains("101 WebSocket Protocol Handshake"));

        let mut body = [0u8; 16];
        with_timeout(client.read_exact(&mut body)).await.unwrap();

        let key1 = handshake::parse_hixie_key(b"18x 6]8vM;54 *(5: { U1]8 0").unwrap();
        let key2 = handshake::parse_hixie_key(b"1_ tx7X d < nw 334J702) 7]o} 8").unwrap();
        let expected = handshake::hixie76_response(key1, key2, b"Tm5ib3R-");
        assert_eq!(body, expected);
    }

    #[async_std::test]
    async fn e5_orderly_close() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        task::spawn(async move {
            let _ = target_listener.accept().await;
        });

        let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let config = Arc::new(test_config(target_addr));
        let handler = task::spawn(async move {
            let (socket, _) = server_listener.accept().await.unwrap();
            handle_connection(socket, config, None).await
        });

        let mut client = with_timeout(TcpStream::connect(server_addr)).await.unwrap();
        let request = "GET / HTTP/1.1\r\n\
                        Host: localhost\r\n\
                        Upgrade: websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                        Sec-WebSocket-Version: 13\r\n\
                        Sec-WebSocket-Protocol: binary\r\n\r\n";
        with_timeout(client.write_all(request.as_bytes())).await.unwrap();
        let _ = with_timeout(read_http_headers(&mut client)).await;

        // Masked close frame, empty payload.
        with_timeout(client.write_all(&[0x88, 0x80, 0, 0, 0, 0])).await.unwrap();

        let result = with_timeout(handler).await;
        assert!(result.is_ok());
    }

    #[async_std::test]
    async fn e6_unmasked_frame_is_protocol_error() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        task::spawn(async move {
            let _ = target_listener.accept().await;
        });

        let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let config = Arc::new(test_config(target_addr));
        let handler = task::spawn(async move {
            let (socket, _) = server_listener.accept().await.unwrap();
            handle_connection(socket, config, None).await
        });

        let mut client = with_timeout(TcpStream::connect(server_addr)).await.unwrap();
        let request = "GET / HTTP/1.1\r\n\
                        Host: localhost\r\n\
                        Upgrade: websocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                        Sec-WebSocket-Version: 13\r\n\
                        Sec-WebSocket-Protocol: binary\r\n\r\n";
        with_timeout(client.write_all(request.as_bytes())).await.unwrap();
        let _ = with_timeout(read_http_headers(&mut client)).await;

        // Unmasked binary data frame: a protocol error, connection-fatal.
        with_timeout(client.write_all(&[0x82, 0x05, b'h', b'e', b'l', b'l', b'o'])).await.unwrap();

        let result = with_timeout(handler).await;
        assert!(result.is_err(), "unmasked client frame must be rejected");
    }

    /// Read bytes up to and including the `\r\n\r\n` terminator and return
    /// them decoded as UTF-8 (the handshake responses are ASCII).
    async fn read_http_headers(client: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n\r\n") {
                break
            }
        }
        String::from_utf8(buf).unwrap()
    }
}
