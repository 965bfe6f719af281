// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! TLS acceptor (C4): load a certificate/key pair once at startup and
//! wrap individual sockets that the listener has already sniffed as TLS.

use futures::io::{AsyncRead, AsyncWrite};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A client transport after C3's handshake has taken place: either the
/// raw socket, or a TLS-wrapped socket. Both sides of the relay only
/// ever see this, never the concrete connection type.
pub enum Transport<S> {
    Plain(S),
    Tls(async_tls::server::TlsStream<S>)
}

impl<S: AsyncRead + Unpin> AsyncRead for Transport<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Transport<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf)
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx)
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_close(cx),
            Transport::Tls(s) => Pin::new(s).poll_close(cx)
        }
    }
}

/// Wraps a loaded certificate chain and key into a reusable acceptor.
#[derive(Clone)]
pub struct Acceptor(async_tls::TlsAcceptor);

impl Acceptor {
    /// Load a PEM certificate chain and a PEM private key (PKCS#8 or
    /// RSA) from disk and build an acceptor that will be shared by every
    /// connection for the lifetime of the process.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let mut config = rustls::ServerConfig::new(rustls::NoClientAuth::new());
        config.set_single_cert(certs, key).map_err(Error::InvalidCertOrKey)?;

        Ok(Acceptor(async_tls::TlsAcceptor::from(Arc::new(config))))
    }

    /// Perform the TLS server handshake over an already-accepted socket.
    pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(&self, socket: S) -> Result<async_tls::server::TlsStream<S>, Error> {
        self.0.accept(socket).await.map_err(Error::Handshake)
    }
}

fn load_certs(path: &Path) -> Result<Vec<rustls::Certificate>, Error> {
    let file = File::open(path).map_err(Error::Io)?;
    rustls::internal::pemfile::certs(&mut BufReader::new(file)).map_err(|()| Error::NoCertificates)
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, Error> {
    let file = File::open(path).map_err(Error::Io)?;
    let mut reader = BufReader::new(file);
    let pkcs8 = rustls::internal::pemfile::pkcs8_private_keys(&mut reader).map_err(|()| Error::NoPrivateKey)?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key)
    }

    let file = File::open(path).map_err(Error::Io)?;
    let mut reader = BufReader::new(file);
    let rsa = rustls::internal::pemfile::rsa_private_keys(&mut reader).map_err(|()| Error::NoPrivateKey)?;
    rsa.into_iter().next().ok_or(Error::NoPrivateKey)
}

/// Errors raised while loading the certificate/key pair or performing a
/// TLS handshake.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("i/o error reading cert or key file: {0}")]
    Io(#[source] io::Error),
    #[error("no certificates found in the given PEM file")]
    NoCertificates,
    #[error("no usable private key found in the given PEM file")]
    NoPrivateKey,
    #[error("certificate or key rejected by rustls: {0}")]
    InvalidCertOrKey(#[source] rustls::TLSError),
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] io::Error)
}
