// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Outbound connection plumbing shared by leaves and super-peers.

use std::time::Duration;

use anyhow::Context;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::addr::PeerAddr;
use crate::codec::write_frame;

/// Deadline for connect and per-frame reads/writes on short-lived
/// connections. Bulk file transfers are exempt.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

pub type FrameReader = BufReader<OwnedReadHalf>;
pub type FrameWriter = OwnedWriteHalf;

/// Connect to `remote` and introduce ourselves with the handshake line.
pub async fn connect_and_greet(
    remote: &PeerAddr,
    local: &PeerAddr,
) -> anyhow::Result<(FrameReader, FrameWriter)> {
    let stream = timeout(
        IO_TIMEOUT,
        TcpStream::connect((remote.host.as_str(), remote.port)),
    )
    .await
    .with_context(|| format!("connecting to {remote} timed out"))?
    .with_context(|| format!("connecting to {remote}"))?;

    let (read_half, write_half) = stream.into_split();
    let reader = BufReader::new(read_half);
    let mut writer = write_half;
    timeout(IO_TIMEOUT, write_frame(&mut writer, &local.to_string()))
        .await
        .with_context(|| format!("handshake with {remote} timed out"))??;
    Ok((reader, writer))
}

/// Open a connection, handshake, deliver exactly one frame, close.
///
/// This is the transport for every inter-super-peer exchange and for
/// pushed deliveries to leaves (queryhits, invalidations).
pub async fn send_one_shot(remote: &PeerAddr, local: &PeerAddr, frame: &str) -> anyhow::Result<()> {
    let (_reader, mut writer) = connect_and_greet(remote, local).await?;
    timeout(IO_TIMEOUT, write_frame(&mut writer, frame))
        .await
        .with_context(|| format!("sending to {remote} timed out"))??;
    Ok(())
}
