// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Super-peer node: indexes the files its leaves advertise and routes
//! queries across the static backbone by TTL-bounded flooding.

mod serve;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};

use crate::addr::PeerAddr;
use crate::history::MessageHistory;

/// Static identity and membership of one super-peer.
#[derive(Debug, Clone)]
pub struct SuperPeerConfig {
    pub addr: PeerAddr,
    pub neighbors: Vec<PeerAddr>,
    pub leaves: Vec<PeerAddr>,
}

/// Cheaply clonable handle to a running super-peer.
#[derive(Clone)]
pub struct SuperPeerHandle {
    inner: Arc<SuperPeerInner>,
}

struct SuperPeerInner {
    addr: PeerAddr,
    neighbors: Vec<PeerAddr>,
    leaves: HashSet<PeerAddr>,
    state: RwLock<SuperState>,
    shutdown: Notify,
}

#[derive(Default)]
struct SuperState {
    /// file name -> leaves currently advertising it
    registry: HashMap<String, HashSet<PeerAddr>>,
    history: MessageHistory,
}

impl SuperPeerHandle {
    pub fn new(config: SuperPeerConfig) -> Self {
        Self {
            inner: Arc::new(SuperPeerInner {
                addr: config.addr,
                neighbors: config.neighbors,
                leaves: config.leaves.into_iter().collect(),
                state: RwLock::new(SuperState::default()),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.inner.addr
    }

    /// Bind the listening socket for this super-peer's declared address.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let listener =
            TcpListener::bind((self.inner.addr.host.as_str(), self.inner.addr.port)).await?;
        Ok(listener)
    }

    /// Ask the accept loop to stop. In-flight connections drain on their own.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
    }

    /// Add `leaf` to the holder set for `name`. Returns the wire status code
    /// (0 ok, >0 failure).
    pub async fn register(&self, name: &str, leaf: &PeerAddr) -> i32 {
        if name.is_empty() {
            return 1;
        }
        let mut state = self.inner.state.write().await;
        state
            .registry
            .entry(name.to_owned())
            .or_default()
            .insert(leaf.clone());
        drop(state);
        tracing::info!("super-peer {}: registered '{name}' to leaf {leaf}", self.inner.addr);
        0
    }

    /// Remove `leaf` from the holder set for `name`; drop the entry when the
    /// set empties. Returns the wire status code.
    pub async fn deregister(&self, name: &str, leaf: &PeerAddr) -> i32 {
        let mut state = self.inner.state.write().await;
        let now_empty = match state.registry.get_mut(name) {
            Some(holders) => {
                if holders.remove(leaf) {
                    tracing::info!(
                        "super-peer {}: deregistered leaf {leaf} from '{name}'",
                        self.inner.addr
                    );
                }
                holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.registry.remove(name);
        }
        0
    }

    /// Leaves currently advertising `name`.
    pub async fn holders(&self, name: &str) -> Vec<PeerAddr> {
        let state = self.inner.state.read().await;
        state
            .registry
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retract every advertisement made by `leaf`. Runs when its session
    /// closes.
    pub(crate) async fn drop_leaf(&self, leaf: &PeerAddr) {
        let mut state = self.inner.state.write().await;
        state.registry.retain(|name, holders| {
            if holders.remove(leaf) {
                tracing::info!(
                    "super-peer {}: deregistered leaf {leaf} from '{name}'",
                    self.inner.addr
                );
            }
            !holders.is_empty()
        });
    }

    #[cfg(test)]
    pub(crate) async fn history_len(&self) -> usize {
        self.inner.state.read().await.history.len()
    }
}
