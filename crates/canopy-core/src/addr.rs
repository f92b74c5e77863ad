// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;
use std::str::FromStr;

use crate::codec::WireError;

/// Network identity of a node, `host:port`.
///
/// Two addresses are equal iff both components are equal. The text form is
/// the wire representation used by handshakes and message fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WireError::malformed("address", s))?;
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(WireError::malformed("address", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| WireError::malformed("address", s))?;
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}
