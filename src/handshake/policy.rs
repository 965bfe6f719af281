// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The request-path → target-port mapping (§4.3's "path pattern") and the
//! target port whitelist.

/// The request-path → target-port mapping described in §4.3: a pattern
/// like `/%d` with exactly one `%d` placeholder for the port number.
#[derive(Debug, Clone)]
pub struct PathPattern {
    prefix: String,
    suffix: String
}

impl PathPattern {
    /// Parse a pattern string. Exactly one `%d` is expected.
    pub fn new(pattern: &str) -> Result<Self, Error> {
        match pattern.find("%d") {
            Some(i) => Ok(PathPattern { prefix: pattern[.. i].to_string(), suffix: pattern[i + 2 ..].to_string() }),
            None => Err(Error::MissingPlaceholder)
        }
    }

    /// Extract the port number a request path encodes, if it matches.
    pub fn extract_port(&self, path: &str) -> Option<u16> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        let digits = rest.strip_suffix(self.suffix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None
        }
        digits.parse().ok()
    }
}

impl Default for PathPattern {
    fn default() -> Self {
        PathPattern::new("/%d").expect("default pattern is valid")
    }
}

/// A target port whitelist, loaded at startup from an external file
/// (§6's "external collaborator" list).
#[derive(Debug, Clone, Default)]
pub struct PortWhitelist(Vec<u16>);

impl PortWhitelist {
    pub fn new(ports: Vec<u16>) -> Self {
        PortWhitelist(ports)
    }

    pub fn allows(&self, port: u16) -> bool {
        self.0.iter().any(|&p| p == port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pattern is missing the %d placeholder")]
    MissingPlaceholder
}
