// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! File transfer between leaves: a FileInfo line, then raw bytes until the
//! sender half-closes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::addr::PeerAddr;
use crate::codec::{read_frame, write_frame, FileInfo, Frame, Message};
use crate::net::{self, IO_TIMEOUT};

use super::LeafHandle;

impl LeafHandle {
    /// Fetch the file named in `msg` from `holder` into `downloads/`.
    ///
    /// The holder leads with its FileInfo record, which captures the true
    /// origin and version so the replica knows whom to poll in pull mode.
    /// A failed transfer leaves no partial file behind.
    pub(crate) async fn download(&self, msg: &Message, holder: &PeerAddr) -> anyhow::Result<FileInfo> {
        let started = Instant::now();
        let (mut reader, mut writer) = net::connect_and_greet(holder, &self.inner.addr).await?;
        timeout(
            IO_TIMEOUT,
            write_frame(&mut writer, &Frame::Obtain(msg.clone()).to_string()),
        )
        .await??;

        let info_line = timeout(IO_TIMEOUT, read_frame(&mut reader))
            .await??
            .context("holder closed before sending file info")?;
        let info: FileInfo = info_line.parse()?;
        if info.name != msg.file.name {
            anyhow::bail!(
                "holder offered '{}' when '{}' was requested",
                info.name,
                msg.file.name
            );
        }

        tracing::info!(
            "leaf {}: downloading '{}' from {holder}...",
            self.inner.addr,
            info.name
        );
        let path = self.download_path(&info.name);
        match copy_to_file(&mut reader, &path).await {
            Ok(bytes) => {
                {
                    let mut registry = self.inner.registry.write().await;
                    registry.insert(info.name.clone(), info.clone());
                }
                tracing::info!(
                    "leaf {}: download of '{}' complete ({bytes} bytes, took {})",
                    self.inner.addr,
                    info.name,
                    elapsed(started.elapsed())
                );
                Ok(info)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(err)
            }
        }
    }

    /// Serve an `obtain` request: FileInfo line first, then the bytes.
    pub(crate) async fn upload<W>(&self, msg: &Message, writer: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let name = &msg.file.name;
        let info = {
            let registry = self.inner.registry.read().await;
            registry.get(name).cloned()
        }
        .with_context(|| format!("'{name}' is not registered here"))?;
        let path = self
            .find_file(name)
            .await
            .with_context(|| format!("'{name}' is not on disk here"))?;

        tracing::info!("leaf {}: uploading '{name}'", self.inner.addr);
        timeout(IO_TIMEOUT, write_frame(writer, &info.to_string())).await??;

        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let bytes = tokio::io::copy(&mut file, writer).await?;
        writer.flush().await?;
        tracing::info!(
            "leaf {}: upload of '{name}' complete ({bytes} bytes)",
            self.inner.addr
        );
        Ok(())
    }

    /// Resolve a file by searching `owned/` first, then `downloads/`.
    async fn find_file(&self, name: &str) -> Option<PathBuf> {
        let owned = self.owned_path(name);
        if is_file(&owned).await {
            return Some(owned);
        }
        let downloaded = self.download_path(name);
        if is_file(&downloaded).await {
            return Some(downloaded);
        }
        None
    }
}

async fn is_file(path: &PathBuf) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Copy the remaining stream into `path`, byte for byte, until the peer
/// half-closes.
async fn copy_to_file<R>(reader: &mut R, path: &PathBuf) -> anyhow::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let bytes = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok(bytes)
}

fn elapsed(duration: Duration) -> String {
    if duration.as_millis() < 1 {
        format!("{} ns", duration.as_nanos())
    } else if duration.as_secs() < 1 {
        format!("{} ms", duration.as_millis())
    } else {
        format!("{} s", duration.as_secs())
    }
}
