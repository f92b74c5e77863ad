// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Leaf peer: owns files under `owned/`, keeps replicas under `downloads/`,
//! talks to exactly one super-peer over a persistent session, and serves
//! other leaves on its own listen port.

mod checker;
mod serve;
mod transfer;
mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::timeout;

use crate::addr::PeerAddr;
use crate::codec::{read_frame, valid_file_name, write_frame, FileInfo, Frame, Message};
use crate::config::ConsistencyModel;
use crate::net::{self, FrameReader, FrameWriter, IO_TIMEOUT};

/// Default hop budget for flooded messages.
pub const DEFAULT_TTL: u32 = 10;

const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct LeafConfig {
    pub addr: PeerAddr,
    pub super_peer: PeerAddr,
    /// Root directory; `owned/` and `downloads/` live beneath it and are
    /// created when absent.
    pub root: PathBuf,
    pub model: ConsistencyModel,
    pub ttl: u32,
    /// Topology file path, kept for the metadata dump.
    pub config_path: Option<PathBuf>,
    /// Poll period of the `owned/` directory watcher.
    pub watch_interval: Duration,
    /// Tick period of the pull-model consistency checker.
    pub check_interval: Duration,
}

impl LeafConfig {
    pub fn new(
        addr: PeerAddr,
        super_peer: PeerAddr,
        root: impl Into<PathBuf>,
        model: ConsistencyModel,
    ) -> Self {
        Self {
            addr,
            super_peer,
            root: root.into(),
            model,
            ttl: DEFAULT_TTL,
            config_path: None,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Cheaply clonable handle to a running leaf.
#[derive(Clone)]
pub struct LeafHandle {
    inner: Arc<LeafInner>,
}

struct LeafInner {
    addr: PeerAddr,
    super_peer: PeerAddr,
    model: ConsistencyModel,
    ttl: u32,
    root: PathBuf,
    owned_dir: PathBuf,
    downloads_dir: PathBuf,
    config_path: Option<PathBuf>,
    watch_interval: Duration,
    check_interval: Duration,
    sequence: AtomicU64,
    registry: RwLock<HashMap<String, FileInfo>>,
    /// Persistent super-peer session. Locked for a full request/response
    /// pair so the session stays strictly ordered.
    link: Mutex<SpLink>,
    /// message id -> downloaded, the single-flight guard for queryhits.
    transfers: Mutex<HashMap<String, bool>>,
    shutdown: Notify,
}

struct SpLink {
    reader: FrameReader,
    writer: FrameWriter,
}

pub struct Leaf;

impl Leaf {
    /// Create the directory layout, connect and handshake with the
    /// super-peer, and announce every file already present in `owned/`.
    ///
    /// The caller is responsible for binding the listen socket and spawning
    /// the background services on the returned handle.
    pub async fn start(config: LeafConfig) -> anyhow::Result<LeafHandle> {
        let owned_dir = config.root.join("owned");
        let downloads_dir = config.root.join("downloads");
        tokio::fs::create_dir_all(&owned_dir)
            .await
            .with_context(|| format!("creating {}", owned_dir.display()))?;
        tokio::fs::create_dir_all(&downloads_dir)
            .await
            .with_context(|| format!("creating {}", downloads_dir.display()))?;

        let (reader, writer) = net::connect_and_greet(&config.super_peer, &config.addr)
            .await
            .with_context(|| format!("connecting to super-peer {}", config.super_peer))?;

        let handle = LeafHandle {
            inner: Arc::new(LeafInner {
                addr: config.addr,
                super_peer: config.super_peer,
                model: config.model,
                ttl: config.ttl,
                root: config.root,
                owned_dir,
                downloads_dir,
                config_path: config.config_path,
                watch_interval: config.watch_interval,
                check_interval: config.check_interval,
                sequence: AtomicU64::new(0),
                registry: RwLock::new(HashMap::new()),
                link: Mutex::new(SpLink { reader, writer }),
                transfers: Mutex::new(HashMap::new()),
                shutdown: Notify::new(),
            }),
        };
        handle.register_owned_dir().await?;
        Ok(handle)
    }
}

impl LeafHandle {
    pub fn addr(&self) -> &PeerAddr {
        &self.inner.addr
    }

    pub fn model(&self) -> ConsistencyModel {
        self.inner.model
    }

    pub(crate) fn owned_path(&self, name: &str) -> PathBuf {
        self.inner.owned_dir.join(name)
    }

    pub(crate) fn download_path(&self, name: &str) -> PathBuf {
        self.inner.downloads_dir.join(name)
    }

    /// Ask every background service to stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
    }

    /// Record the file locally (keeping any existing entry) and announce it
    /// to the super-peer.
    pub async fn register(&self, file: FileInfo) -> anyhow::Result<()> {
        {
            let mut registry = self.inner.registry.write().await;
            registry.entry(file.name.clone()).or_insert_with(|| file.clone());
        }
        let msg = Message::plain(file.clone(), self.inner.addr.clone());
        let rc = self.send_request(Frame::Register(msg)).await?;
        if rc != 0 {
            tracing::warn!(
                "leaf {}: super-peer refused registration of '{}' (code {rc})",
                self.inner.addr,
                file.name
            );
        }
        Ok(())
    }

    /// Retract `name` locally and at the super-peer. When this leaf is the
    /// origin and the model is push, an invalidate flood follows.
    pub async fn deregister(&self, name: &str) -> anyhow::Result<()> {
        let removed = {
            let mut registry = self.inner.registry.write().await;
            registry.remove(name)
        };
        let Some(info) = removed else {
            return Ok(());
        };

        let msg = Message::plain(info.clone(), self.inner.addr.clone());
        let rc = self.send_request(Frame::Deregister(msg)).await?;
        if rc != 0 {
            tracing::warn!(
                "leaf {}: super-peer refused deregistration of '{name}' (code {rc})",
                self.inner.addr
            );
        }

        if info.origin == self.inner.addr && self.inner.model == ConsistencyModel::Push {
            self.invalidate(name).await?;
        }
        Ok(())
    }

    /// Issue a flood query for `name`, unless we already own it. A stale
    /// copy in `downloads/` does not suppress the query; that is what lets
    /// `refresh` replace an outdated replica.
    pub async fn query(&self, name: &str) -> anyhow::Result<()> {
        if self.owned_path(name).is_file() {
            tracing::info!("leaf {}: '{name}' is already here, ignoring", self.inner.addr);
            return Ok(());
        }
        let msg = Message {
            id: self.next_message_id(),
            ttl: self.inner.ttl,
            file: FileInfo::owned(name, self.inner.addr.clone()),
            sender: self.inner.addr.clone(),
        };
        tracing::info!("leaf {}: searching for '{name}' ({})", self.inner.addr, msg.id);
        self.send_oneway(Frame::Query(msg)).await
    }

    /// Pull model only: re-issue a query after an `outdated` verdict.
    pub async fn refresh(&self, name: &str) -> anyhow::Result<()> {
        if !self.inner.model.is_pull() {
            tracing::warn!("leaf {}: refresh is a pull-model command", self.inner.addr);
            return Ok(());
        }
        self.query(name).await
    }

    /// Flood an invalidate for a file this leaf originates.
    pub async fn invalidate(&self, name: &str) -> anyhow::Result<()> {
        let msg = Message {
            id: self.next_message_id(),
            ttl: self.inner.ttl,
            file: FileInfo::owned(name, self.inner.addr.clone()),
            sender: self.inner.addr.clone(),
        };
        tracing::info!("leaf {}: invalidating '{name}' ({})", self.inner.addr, msg.id);
        self.send_oneway(Frame::Invalidate(msg)).await
    }

    /// Version-bump an owned file after a local modification. A file that
    /// somehow escaped registration is registered fresh instead.
    pub(crate) async fn note_modified(&self, name: &str) -> anyhow::Result<()> {
        let bumped = {
            let mut registry = self.inner.registry.write().await;
            match registry.get_mut(name) {
                Some(info) => {
                    info.version += 1;
                    tracing::info!(
                        "leaf {}: '{name}' modified, now version {}",
                        self.inner.addr,
                        info.version
                    );
                    true
                }
                None => false,
            }
        };
        if !bumped {
            return self
                .register(FileInfo::owned(name, self.inner.addr.clone()))
                .await;
        }
        if self.inner.model == ConsistencyModel::Push {
            self.invalidate(name).await?;
        }
        Ok(())
    }

    /// Multi-line metadata dump for the `print` shell command.
    pub async fn info(&self) -> String {
        let registry = self.inner.registry.read().await;
        let mut entries: Vec<String> = registry.values().map(|info| info.to_string()).collect();
        entries.sort();
        let config = self
            .inner
            .config_path
            .as_deref()
            .map(Path::display)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "<none>".to_owned());
        format!(
            "address:          {}\n\
             super-peer:       {}\n\
             root directory:   {}\n\
             owned files:      owned/\n\
             downloaded files: downloads/\n\
             config:           {config}\n\
             ttl:              {}\n\
             ttr (minutes):    {}\n\
             message sequence: {}\n\
             file registry:    [{}]",
            self.inner.addr,
            self.inner.super_peer,
            self.inner.root.display(),
            self.inner.ttl,
            self.inner
                .model
                .ttr_minutes()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_owned()),
            self.inner.sequence.load(Ordering::Relaxed),
            entries.join(", "),
        )
    }

    /// Snapshot of the registry entry for `name`, mainly for inspection.
    pub async fn registry_entry(&self, name: &str) -> Option<FileInfo> {
        self.inner.registry.read().await.get(name).cloned()
    }

    fn next_message_id(&self) -> String {
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{seq}", self.inner.addr)
    }

    /// Scan `owned/` and register every regular file with a wire-safe name.
    async fn register_owned_dir(&self) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.inner.owned_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !valid_file_name(&name) {
                tracing::warn!(
                    "leaf {}: skipping '{name}', not a shareable file name",
                    self.inner.addr
                );
                continue;
            }
            self.register(FileInfo::owned(name, self.inner.addr.clone()))
                .await?;
        }
        Ok(())
    }

    /// Send a frame on the super-peer session and read the integer status
    /// code it answers with.
    async fn send_request(&self, frame: Frame) -> anyhow::Result<i32> {
        let mut link = self.inner.link.lock().await;
        timeout(IO_TIMEOUT, write_frame(&mut link.writer, &frame.to_string())).await??;
        let reply = timeout(IO_TIMEOUT, read_frame(&mut link.reader))
            .await??
            .context("super-peer session closed")?;
        let rc: i32 = reply
            .trim()
            .parse()
            .with_context(|| format!("unexpected status reply {reply:?}"))?;
        Ok(rc)
    }

    /// Send a frame on the super-peer session that has no reply.
    async fn send_oneway(&self, frame: Frame) -> anyhow::Result<()> {
        let mut link = self.inner.link.lock().await;
        timeout(IO_TIMEOUT, write_frame(&mut link.writer, &frame.to_string())).await??;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn completed_transfers(&self) -> usize {
        self.inner
            .transfers
            .lock()
            .await
            .values()
            .filter(|done| **done)
            .count()
    }
}
