// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use wsbridge::config::ListenerConfig;
use wsbridge::tls;

fn main() -> ExitCode {
    let config = match ListenerConfig::from_args(std::env::args()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("wsbridge: {}", e);
            return ExitCode::FAILURE
        }
    };

    env_logger::Builder::new().filter_level(config.log_filter()).init();

    if config.daemon {
        log::warn!("--daemon was given; wsbridge does not fork, run it under a supervisor instead");
    }

    let acceptor = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => match tls::Acceptor::load(cert, key) {
            Ok(a) => Some(a),
            Err(e) => {
                eprintln!("wsbridge: failed to load TLS certificate: {}", e);
                return ExitCode::FAILURE
            }
        },
        _ => None
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::SIGTERM, shutdown.clone()) {
        log::warn!("could not install SIGTERM handler: {}", e);
    }
    if let Err(e) = signal_hook::flag::register(signal_hook::SIGINT, shutdown.clone()) {
        log::warn!("could not install SIGINT handler: {}", e);
    }
    // Broken-pipe writes already surface as a short write / `Err` through
    // async-std rather than killing the process, but install an explicit
    // ignore so a write to a target that vanished mid-relay behaves the
    // same under every libc default disposition.
    let sigpipe_ignored = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::SIGPIPE, sigpipe_ignored) {
        log::warn!("could not install SIGPIPE handler: {}", e);
    }

    log::info!("listening on {}, relaying to {}", config.listen_addr, config.target_host);

    let config = Arc::new(config);
    let result = async_std::task::block_on(wsbridge::listener::run(config, acceptor, shutdown));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wsbridge: fatal i/o error: {}", e);
            ExitCode::FAILURE
        }
    }
}
