// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Accept loop, session classification, and the flood router.

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::addr::PeerAddr;
use crate::codec::{read_frame, write_frame, Frame, Message};
use crate::net::{self, FrameReader, FrameWriter, IO_TIMEOUT};

use super::SuperPeerHandle;

impl SuperPeerHandle {
    /// Spawn the accept loop. Each inbound connection runs in its own task;
    /// the loop stops when [`SuperPeerHandle::shutdown`] fires.
    pub fn spawn_listener(self, listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("super-peer {}: listening", self.inner.addr);
            let shutdown = self.inner.shutdown.notified();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    accepted = listener.accept() => {
                        let stream = match accepted {
                            Ok((stream, _)) => stream,
                            Err(err) => {
                                tracing::warn!("super-peer {}: accept failed: {err}", self.inner.addr);
                                continue;
                            }
                        };
                        let node = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = node.handle_connection(stream).await {
                                tracing::warn!(
                                    "super-peer {}: connection error: {err:#}",
                                    node.inner.addr
                                );
                            }
                        });
                    }
                }
            }
            tracing::info!("super-peer {}: listener stopped", self.inner.addr);
        })
    }

    /// Read the handshake line and classify the remote party as a neighbor
    /// super-peer, one of our own leaves, or a foreign node (rejected).
    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = write_half;

        let Some(handshake) = timeout(IO_TIMEOUT, read_frame(&mut reader)).await?? else {
            return Ok(());
        };
        let caller: PeerAddr = handshake.parse()?;

        if self.inner.neighbors.contains(&caller) {
            self.serve_neighbor(&mut reader, caller).await
        } else if self.inner.leaves.contains(&caller) {
            self.serve_leaf(&mut reader, &mut writer, caller).await
        } else {
            tracing::warn!(
                "super-peer {}: rejecting foreign peer {caller}",
                self.inner.addr
            );
            Ok(())
        }
    }

    /// A neighbor super-peer exchange is single-shot: one request, then the
    /// initiator closes.
    async fn serve_neighbor(&self, reader: &mut FrameReader, caller: PeerAddr) -> anyhow::Result<()> {
        let Some(line) = timeout(IO_TIMEOUT, read_frame(reader)).await?? else {
            return Ok(());
        };
        let frame: Frame = line.parse()?;
        tracing::debug!(
            "super-peer {}: '{}' from neighbor {caller}",
            self.inner.addr,
            frame.command()
        );
        match frame {
            Frame::Query(msg) => {
                let source = msg.sender.clone();
                self.route_query(msg, source).await;
            }
            Frame::QueryHit(msg, holder) => self.relay_queryhit(msg, holder).await,
            Frame::Invalidate(msg) => {
                let source = msg.sender.clone();
                self.propagate_invalidate(msg, source).await;
            }
            other => {
                tracing::warn!(
                    "super-peer {}: neighbor {caller} sent unexpected '{}', ignoring",
                    self.inner.addr,
                    other.command()
                );
            }
        }
        Ok(())
    }

    /// A leaf session persists until EOF. Whatever ends it, every file the
    /// leaf advertised is deregistered afterwards.
    async fn serve_leaf(
        &self,
        reader: &mut FrameReader,
        writer: &mut FrameWriter,
        leaf: PeerAddr,
    ) -> anyhow::Result<()> {
        tracing::info!("super-peer {}: leaf session with {leaf}", self.inner.addr);
        let session = self.leaf_session(reader, writer, &leaf).await;
        self.drop_leaf(&leaf).await;
        tracing::info!("super-peer {}: leaf session with {leaf} closed", self.inner.addr);
        session
    }

    async fn leaf_session(
        &self,
        reader: &mut FrameReader,
        writer: &mut FrameWriter,
        leaf: &PeerAddr,
    ) -> anyhow::Result<()> {
        while let Some(line) = read_frame(reader).await? {
            let frame: Frame = line.parse()?;
            match frame {
                Frame::Register(msg) => {
                    let rc = self.register(&msg.file.name, leaf).await;
                    timeout(IO_TIMEOUT, write_frame(writer, &rc.to_string())).await??;
                }
                Frame::Deregister(msg) => {
                    let rc = self.deregister(&msg.file.name, leaf).await;
                    timeout(IO_TIMEOUT, write_frame(writer, &rc.to_string())).await??;
                }
                Frame::Query(msg) => self.route_query(msg, leaf.clone()).await,
                Frame::Invalidate(msg) => self.propagate_invalidate(msg, leaf.clone()).await,
                other => {
                    tracing::warn!(
                        "super-peer {}: leaf {leaf} sent unexpected '{}', ignoring",
                        self.inner.addr,
                        other.command()
                    );
                }
            }
        }
        Ok(())
    }

    /// Flood-route one query.
    ///
    /// `source` is the party queryhits travel back to: the issuing leaf on a
    /// leaf session, the upstream super-peer otherwise. Dedup and the
    /// history insert happen atomically under the state lock.
    pub(crate) async fn route_query(&self, msg: Message, source: PeerAddr) {
        let holders = {
            let mut state = self.inner.state.write().await;
            if state.history.contains(&msg.id) {
                tracing::debug!(
                    "super-peer {}: query {} already seen, dropped",
                    self.inner.addr,
                    msg.id
                );
                return;
            }
            state.history.record(&msg.id, source.clone());
            state
                .registry
                .get(&msg.file.name)
                .map(|set| set.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };

        if !holders.is_empty() {
            if let Err(err) = self.send_queryhits(&source, &msg, &holders).await {
                tracing::warn!(
                    "super-peer {}: could not deliver queryhits to {source}: {err:#}",
                    self.inner.addr
                );
            }
        }

        self.forward_to_neighbors(msg, Frame::Query).await;
    }

    /// Report every known holder back to `source` over one fresh connection,
    /// one queryhit line per holder, in registry-iteration order.
    async fn send_queryhits(
        &self,
        source: &PeerAddr,
        msg: &Message,
        holders: &[PeerAddr],
    ) -> anyhow::Result<()> {
        let (_reader, mut writer) = net::connect_and_greet(source, &self.inner.addr).await?;
        for holder in holders {
            tracing::info!(
                "super-peer {}: queryhit '{}' held by {holder}, answering {source}",
                self.inner.addr,
                msg.file.name
            );
            let frame = Frame::QueryHit(msg.clone(), holder.clone());
            timeout(IO_TIMEOUT, write_frame(&mut writer, &frame.to_string())).await??;
        }
        Ok(())
    }

    /// Route a queryhit one hop back along the recorded reverse path. An id
    /// the history has already evicted is dropped silently.
    async fn relay_queryhit(&self, msg: Message, holder: PeerAddr) {
        let back = {
            let state = self.inner.state.read().await;
            state.history.return_addr(&msg.id).cloned()
        };
        let Some(back) = back else {
            tracing::debug!(
                "super-peer {}: queryhit {} has no return path, dropped",
                self.inner.addr,
                msg.id
            );
            return;
        };
        let frame = Frame::QueryHit(msg, holder);
        if let Err(err) = net::send_one_shot(&back, &self.inner.addr, &frame.to_string()).await {
            tracing::warn!(
                "super-peer {}: could not relay queryhit to {back}: {err:#}",
                self.inner.addr
            );
        }
    }

    /// Invalidate handling follows the query rule: record once, notify our
    /// own replica holders, then keep flooding while TTL lasts.
    ///
    /// `source` is the leaf that pushed the invalidate on its session, or
    /// the upstream super-peer. Holders other than the source and the origin
    /// are told to discard, then deregistered.
    pub(crate) async fn propagate_invalidate(&self, msg: Message, source: PeerAddr) {
        let victims = {
            let mut state = self.inner.state.write().await;
            if state.history.contains(&msg.id) {
                tracing::debug!(
                    "super-peer {}: invalidate {} already seen, dropped",
                    self.inner.addr,
                    msg.id
                );
                return;
            }
            state.history.record(&msg.id, source.clone());
            let victims: Vec<PeerAddr> = state
                .registry
                .get(&msg.file.name)
                .map(|set| {
                    set.iter()
                        .filter(|leaf| **leaf != source && **leaf != msg.file.origin)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let now_empty = match state.registry.get_mut(&msg.file.name) {
                Some(holders) => {
                    for victim in &victims {
                        holders.remove(victim);
                    }
                    holders.is_empty()
                }
                None => false,
            };
            if now_empty {
                state.registry.remove(&msg.file.name);
            }
            victims
        };

        let frame = Frame::Invalidate(msg.clone());
        for victim in victims {
            tracing::info!(
                "super-peer {}: telling leaf {victim} to discard '{}'",
                self.inner.addr,
                msg.file.name
            );
            if let Err(err) = net::send_one_shot(&victim, &self.inner.addr, &frame.to_string()).await
            {
                tracing::warn!(
                    "super-peer {}: could not deliver invalidate to {victim}: {err:#}",
                    self.inner.addr
                );
            }
        }

        self.forward_to_neighbors(msg, Frame::Invalidate).await;
    }

    /// Forward a flooded message to every neighbor except the hop it came
    /// from, with TTL decremented and the sender rewritten to us. Neighbor
    /// failures are logged, never retried.
    async fn forward_to_neighbors(&self, mut msg: Message, wrap: fn(Message) -> Frame) {
        if msg.ttl == 0 {
            return;
        }
        let previous_hop = msg.sender.clone();
        msg.ttl -= 1;
        msg.sender = self.inner.addr.clone();

        for neighbor in &self.inner.neighbors {
            if *neighbor == previous_hop {
                continue;
            }
            let frame = wrap(msg.clone());
            tracing::debug!(
                "super-peer {}: forwarding '{}' {} to neighbor {neighbor}",
                self.inner.addr,
                frame.command(),
                msg.id
            );
            if let Err(err) =
                net::send_one_shot(neighbor, &self.inner.addr, &frame.to_string()).await
            {
                tracing::warn!(
                    "super-peer {}: could not reach neighbor {neighbor}: {err:#}",
                    self.inner.addr
                );
            }
        }
    }
}
