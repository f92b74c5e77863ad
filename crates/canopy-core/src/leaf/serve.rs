// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Inbound peer connections: invalidations, queryhits, uploads, probes.

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::addr::PeerAddr;
use crate::codec::{read_frame, write_frame, FileInfo, Frame, Message, StatusVerdict};
use crate::net::{FrameReader, IO_TIMEOUT};

use super::LeafHandle;

impl LeafHandle {
    /// Spawn the accept loop for this leaf's listen port.
    pub fn spawn_listener(self, listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("leaf {}: listening", self.inner.addr);
            let shutdown = self.inner.shutdown.notified();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    accepted = listener.accept() => {
                        let stream = match accepted {
                            Ok((stream, _)) => stream,
                            Err(err) => {
                                tracing::warn!("leaf {}: accept failed: {err}", self.inner.addr);
                                continue;
                            }
                        };
                        let node = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = node.handle_connection(stream).await {
                                tracing::warn!("leaf {}: connection error: {err:#}", node.inner.addr);
                            }
                        });
                    }
                }
            }
            tracing::info!("leaf {}: listener stopped", self.inner.addr);
        })
    }

    /// Serve one inbound connection. Frames are consumed until the peer
    /// closes; a super-peer reporting several holders sends one queryhit
    /// line per holder over a single connection.
    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = write_half;

        let Some(handshake) = timeout(IO_TIMEOUT, read_frame(&mut reader)).await?? else {
            return Ok(());
        };
        let caller: PeerAddr = handshake.parse()?;
        tracing::debug!("leaf {}: connected with {caller}", self.inner.addr);

        while let Some(line) = timeout(IO_TIMEOUT, read_frame(&mut reader)).await?? {
            let frame: Frame = line.parse()?;
            match frame {
                Frame::Invalidate(msg) => self.apply_invalidate(&msg).await,
                Frame::QueryHit(msg, holder) => self.accept_queryhit(msg, holder).await,
                Frame::Obtain(msg) => {
                    self.upload(&msg, &mut writer).await?;
                    break;
                }
                Frame::Status(info) => {
                    let verdict = self.status_of(&info).await;
                    tracing::info!(
                        "leaf {}: status of '{}' for {caller}: {verdict}",
                        self.inner.addr,
                        info.name
                    );
                    timeout(IO_TIMEOUT, write_frame(&mut writer, verdict.as_str())).await??;
                }
                other => {
                    tracing::warn!(
                        "leaf {}: unexpected '{}' from {caller}, ignoring",
                        self.inner.addr,
                        other.command()
                    );
                }
            }
        }
        Ok(())
    }

    /// Discard a replica the origin has invalidated. `owned/` is never
    /// touched; an origin does not receive invalidates for its own files.
    async fn apply_invalidate(&self, msg: &Message) {
        let name = &msg.file.name;
        let removed = {
            let mut registry = self.inner.registry.write().await;
            registry.remove(name).is_some()
        };
        if removed {
            tracing::info!("leaf {}: invalidated '{name}', dropping replica", self.inner.addr);
        }
        if let Err(err) = tokio::fs::remove_file(self.download_path(name)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "leaf {}: could not delete replica '{name}': {err}",
                    self.inner.addr
                );
            }
        }
    }

    /// At most one download is initiated per message id, however many
    /// holders the flood reports. The claim is made before the transfer
    /// starts and only released if it fails.
    async fn accept_queryhit(&self, msg: Message, holder: PeerAddr) {
        {
            let mut transfers = self.inner.transfers.lock().await;
            if transfers.get(&msg.id).copied().unwrap_or(false) {
                tracing::debug!(
                    "leaf {}: queryhit {} already handled, ignoring offer from {holder}",
                    self.inner.addr,
                    msg.id
                );
                return;
            }
            transfers.insert(msg.id.clone(), true);
        }

        match self.download(&msg, &holder).await {
            Ok(info) => {
                // Announce the new replica so invalidations can reach us.
                if let Err(err) = self.register(info).await {
                    tracing::warn!(
                        "leaf {}: could not announce downloaded '{}': {err:#}",
                        self.inner.addr,
                        msg.file.name
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    "leaf {}: download of '{}' from {holder} failed: {err:#}",
                    self.inner.addr,
                    msg.file.name
                );
                self.inner.transfers.lock().await.remove(&msg.id);
            }
        }
    }

    /// Answer a pull-model probe by comparing registry versions.
    async fn status_of(&self, probe: &FileInfo) -> StatusVerdict {
        let registry = self.inner.registry.read().await;
        match registry.get(&probe.name) {
            None => StatusVerdict::Deleted,
            Some(ours) if ours.version == probe.version => StatusVerdict::UpToDate,
            Some(_) => StatusVerdict::Outdated,
        }
    }
}
