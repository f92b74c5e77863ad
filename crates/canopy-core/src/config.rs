// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::Path;

use anyhow::Context;

use crate::addr::PeerAddr;

/// Replica coherence strategy for the whole overlay.
///
/// Push floods origin-initiated invalidations; pull makes each replica poll
/// its origin, with `ttr_minutes` bounding the permitted staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyModel {
    Push,
    Pull { ttr_minutes: u64 },
}

impl ConsistencyModel {
    pub fn is_pull(self) -> bool {
        matches!(self, Self::Pull { .. })
    }

    pub fn ttr_minutes(self) -> Option<u64> {
        match self {
            Self::Push => None,
            Self::Pull { ttr_minutes } => Some(ttr_minutes),
        }
    }
}

/// Static overlay topology shared by every node.
///
/// The file is line-oriented and whitespace-delimited:
///
/// ```text
/// c push                    | c pull <ttr_minutes>
/// s <sp_addr> <neighbor_addr>
/// p <sp_addr> <leaf_addr>
/// ```
///
/// Unknown record types are logged and skipped; a malformed declared record
/// aborts parsing so a node never starts on a half-read topology. A missing
/// `c` record defaults to push.
#[derive(Debug, Clone)]
pub struct Topology {
    pub model: ConsistencyModel,
    neighbor_links: Vec<(PeerAddr, PeerAddr)>,
    leaf_links: Vec<(PeerAddr, PeerAddr)>,
}

impl Topology {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading topology config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing topology config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut model = None;
        let mut neighbor_links = Vec::new();
        let mut leaf_links = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields[0] {
                "c" => {
                    model = Some(parse_model(&fields).with_context(|| format!("line {line_no}"))?)
                }
                "s" => neighbor_links
                    .push(parse_link(&fields).with_context(|| format!("line {line_no}"))?),
                "p" => {
                    leaf_links.push(parse_link(&fields).with_context(|| format!("line {line_no}"))?)
                }
                other => {
                    tracing::warn!("topology line {line_no}: unknown record type '{other}', ignoring");
                }
            }
        }

        Ok(Self {
            model: model.unwrap_or(ConsistencyModel::Push),
            neighbor_links,
            leaf_links,
        })
    }

    /// Super-peer neighbors declared for `sp`.
    pub fn neighbors_of(&self, sp: &PeerAddr) -> Vec<PeerAddr> {
        self.neighbor_links
            .iter()
            .filter(|(owner, _)| owner == sp)
            .map(|(_, neighbor)| neighbor.clone())
            .collect()
    }

    /// Leaves declared for `sp`.
    pub fn leaves_of(&self, sp: &PeerAddr) -> Vec<PeerAddr> {
        self.leaf_links
            .iter()
            .filter(|(owner, _)| owner == sp)
            .map(|(_, leaf)| leaf.clone())
            .collect()
    }

    /// The super-peer a given leaf attaches to, if declared.
    pub fn super_peer_of(&self, leaf: &PeerAddr) -> Option<PeerAddr> {
        self.leaf_links
            .iter()
            .find(|(_, member)| member == leaf)
            .map(|(owner, _)| owner.clone())
    }
}

fn parse_model(fields: &[&str]) -> anyhow::Result<ConsistencyModel> {
    match fields {
        ["c", "push"] => Ok(ConsistencyModel::Push),
        ["c", "pull", ttr] => {
            let ttr_minutes = ttr
                .parse::<u64>()
                .with_context(|| format!("invalid ttr '{ttr}'"))?;
            Ok(ConsistencyModel::Pull { ttr_minutes })
        }
        _ => anyhow::bail!("consistency record must be 'c push' or 'c pull <minutes>'"),
    }
}

fn parse_link(fields: &[&str]) -> anyhow::Result<(PeerAddr, PeerAddr)> {
    let [_, owner, member] = fields else {
        anyhow::bail!("expected '<type> <address:port> <address:port>'");
    };
    let owner: PeerAddr = owner
        .parse()
        .with_context(|| format!("invalid address '{owner}'"))?;
    let member: PeerAddr = member
        .parse()
        .with_context(|| format!("invalid address '{member}'"))?;
    Ok((owner, member))
}
