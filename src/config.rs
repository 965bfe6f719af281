// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Command-line configuration: argument parsing, the whitelist file, and
//! the PID file — the "deliberately dumb" external collaborators named
//! in the purpose/scope section.

use crate::handshake::policy::{PathPattern, PortWhitelist};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

/// Fully resolved startup configuration, built once in `main` and then
/// shared read-only (`Arc`) into every accepted connection's task.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listen_addr: SocketAddr,
    pub target_host: String,
    pub target_port: Option<u16>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ssl_only: bool,
    pub whitelist: PortWhitelist,
    pub pattern: PathPattern,
    pub daemon: bool,
    pub verbosity: u64
}

impl ListenerConfig {
    /// Parse `argv`, then load the whitelist file if one was given.
    /// `argv[0]` is the conventional program name, as `clap` expects.
    pub fn from_args<I, T>(argv: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone
    {
        let matches = build_app().get_matches_from(argv);

        let listen_addr = parse_listen_spec(matches.value_of("listen").expect("required"))?;

        let target = matches.value_of("target").expect("required");
        let (target_host, target_port) = parse_target_spec(target)?;

        let cert = matches.value_of("cert").map(PathBuf::from);
        let key = matches.value_of("key").map(PathBuf::from);
        let ssl_only = matches.is_present("ssl-only");
        let daemon = matches.is_present("daemon");
        let verbosity = matches.occurrences_of("verbose");

        let whitelist = match matches.value_of("whitelist") {
            Some(path) => load_whitelist(path)?,
            None => PortWhitelist::default()
        };

        let pattern = match matches.value_of("pattern") {
            Some(p) => PathPattern::new(p).map_err(Error::Pattern)?,
            None => PathPattern::default()
        };

        if ssl_only && (cert.is_none() || key.is_none()) {
            return Err(Error::SslOnlyWithoutCert)
        }

        Ok(ListenerConfig { listen_addr, target_host, target_port, cert, key, ssl_only, whitelist, pattern, daemon, verbosity })
    }

    /// Map `occurrences_of("verbose")` onto a `log` filter the same way
    /// the teacher's CLI mapped it onto a `slog::Level`.
    pub fn log_filter(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace
        }
    }
}

fn build_app() -> clap::App<'static, 'static> {
    clap::App::new("wsbridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A WebSocket-to-TCP relay supporting Hixie-76/75 and RFC 6455, with optional TLS")
        .arg(clap::Arg::with_name("listen").required(true).help("[listen_host:]listen_port"))
        .arg(clap::Arg::with_name("target").required(true).help("target_host[:target_port]"))
        .arg(clap::Arg::with_name("cert").long("cert").takes_value(true).help("PEM certificate chain for TLS"))
        .arg(clap::Arg::with_name("key").long("key").takes_value(true).help("PEM private key for TLS"))
        .arg(clap::Arg::with_name("ssl-only").long("ssl-only").help("reject plain (non-TLS) connections"))
        .arg(clap::Arg::with_name("whitelist").long("whitelist").takes_value(true).help("file of allowed target ports, one per line"))
        .arg(clap::Arg::with_name("pattern").long("pattern").takes_value(true).help("request path pattern with one %d placeholder (default: /%d)"))
        .arg(clap::Arg::with_name("daemon").long("daemon").help("detach and run in the background"))
        .arg(clap::Arg::with_name("verbose").short("v").multiple(true).help("increase log verbosity (repeatable)"))
}

fn parse_listen_spec(spec: &str) -> Result<SocketAddr, Error> {
    match spec.rfind(':') {
        Some(i) => {
            let host = &spec[.. i];
            let port: u16 = spec[i + 1 ..].parse().map_err(|_| Error::InvalidListenSpec(spec.to_string()))?;
            let addr = IpAddr::from_str(host).map_err(|_| Error::InvalidListenSpec(spec.to_string()))?;
            Ok(SocketAddr::new(addr, port))
        }
        None => {
            let port: u16 = spec.parse().map_err(|_| Error::InvalidListenSpec(spec.to_string()))?;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        }
    }
}

fn parse_target_spec(spec: &str) -> Result<(String, Option<u16>), Error> {
    match spec.rfind(':') {
        Some(i) => {
            let host = &spec[.. i];
            let port: u16 = spec[i + 1 ..].parse().map_err(|_| Error::InvalidTargetSpec(spec.to_string()))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((spec.to_string(), None))
    }
}

fn load_whitelist(path: &str) -> Result<PortWhitelist, Error> {
    let text = fs::read_to_string(path).map_err(|e| Error::Whitelist(path.to_string(), e))?;
    let mut ports = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue
        }
        match line.parse::<u16>() {
            Ok(p) => ports.push(p),
            Err(_) => return Err(Error::InvalidWhitelistEntry(line.to_string()))
        }
    }
    Ok(PortWhitelist::new(ports))
}

/// Write the current process id to `path`, as an external tool (e.g. an
/// init script) would expect to find it.
pub fn write_pid_file(path: &std::path::Path) -> Result<(), Error> {
    fs::write(path, std::process::id().to_string()).map_err(|e| Error::PidFile(path.display().to_string(), e))
}

/// Process-fatal configuration errors, surfaced before any connection is
/// ever accepted.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid listen address {0:?}")]
    InvalidListenSpec(String),
    #[error("invalid target address {0:?}")]
    InvalidTargetSpec(String),
    #[error("--ssl-only requires both --cert and --key")]
    SslOnlyWithoutCert,
    #[error("invalid --pattern: {0}")]
    Pattern(#[source] crate::handshake::policy::Error),
    #[error("could not read whitelist file {0:?}: {1}")]
    Whitelist(String, #[source] std::io::Error),
    #[error("invalid whitelist entry: {0:?}")]
    InvalidWhitelistEntry(String),
    #[error("could not write pid file {0:?}: {1}")]
    PidFile(String, #[source] std::io::Error)
}
