// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Pull-model consistency checker.
//!
//! Periodically probes the origin of every replica whose time-to-refresh
//! has lapsed and reacts to the verdict. Push-model nodes never spawn this.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::codec::{read_frame, write_frame, FileInfo, Frame, StatusVerdict};
use crate::config::ConsistencyModel;
use crate::net::{self, IO_TIMEOUT};

use super::LeafHandle;

impl LeafHandle {
    /// Spawn the checker task. A no-op under the push model.
    pub fn spawn_checker(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let ConsistencyModel::Pull { ttr_minutes } = self.inner.model else {
                return;
            };
            let ttr = Duration::from_secs(ttr_minutes * 60);
            // Most recent successful probe per file. Absent means never
            // checked, which makes the file immediately due.
            let mut last_checked: HashMap<String, Instant> = HashMap::new();

            let shutdown = self.inner.shutdown.notified();
            tokio::pin!(shutdown);
            let mut tick = tokio::time::interval(self.inner.check_interval);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tick.tick() => {}
                }

                let replicas: Vec<FileInfo> = {
                    let registry = self.inner.registry.read().await;
                    registry
                        .values()
                        .filter(|info| info.origin != self.inner.addr)
                        .cloned()
                        .collect()
                };

                for info in replicas {
                    let due = last_checked
                        .get(&info.name)
                        .map_or(true, |at| at.elapsed() >= ttr);
                    if !due {
                        continue;
                    }

                    match self.probe_origin(&info).await {
                        Ok(StatusVerdict::UpToDate) => {
                            last_checked.insert(info.name.clone(), Instant::now());
                        }
                        Ok(StatusVerdict::Deleted) => {
                            tracing::info!(
                                "leaf {}: origin deleted '{}', dropping replica",
                                self.inner.addr,
                                info.name
                            );
                            last_checked.remove(&info.name);
                            if let Err(err) = self.deregister(&info.name).await {
                                tracing::warn!(
                                    "leaf {}: deregister of '{}' failed: {err:#}",
                                    self.inner.addr,
                                    info.name
                                );
                            }
                            if let Err(err) =
                                tokio::fs::remove_file(self.download_path(&info.name)).await
                            {
                                if err.kind() != std::io::ErrorKind::NotFound {
                                    tracing::warn!(
                                        "leaf {}: could not delete replica '{}': {err}",
                                        self.inner.addr,
                                        info.name
                                    );
                                }
                            }
                        }
                        Ok(StatusVerdict::Outdated) => {
                            // Keep the file so the user can decide; a
                            // `refresh` redownloads the current version.
                            tracing::info!(
                                "leaf {}: '{}' is out of date, deregistering ('refresh {}' to redownload)",
                                self.inner.addr,
                                info.name,
                                info.name
                            );
                            last_checked.remove(&info.name);
                            if let Err(err) = self.deregister(&info.name).await {
                                tracing::warn!(
                                    "leaf {}: deregister of '{}' failed: {err:#}",
                                    self.inner.addr,
                                    info.name
                                );
                            }
                        }
                        Err(err) => {
                            // No result this tick; the next period retries.
                            tracing::debug!(
                                "leaf {}: status probe for '{}' failed: {err:#}",
                                self.inner.addr,
                                info.name
                            );
                        }
                    }
                }
            }
            tracing::info!("leaf {}: consistency checker stopped", self.inner.addr);
        })
    }

    /// One status exchange with the origin of `info`.
    async fn probe_origin(&self, info: &FileInfo) -> anyhow::Result<StatusVerdict> {
        let (mut reader, mut writer) =
            net::connect_and_greet(&info.origin, &self.inner.addr).await?;
        timeout(
            IO_TIMEOUT,
            write_frame(&mut writer, &Frame::Status(info.clone()).to_string()),
        )
        .await??;
        let reply = timeout(IO_TIMEOUT, read_frame(&mut reader))
            .await??
            .context("origin closed without a verdict")?;
        let verdict: StatusVerdict = reply
            .parse()
            .with_context(|| format!("unrecognized status reply {reply:?}"))?;
        tracing::debug!(
            "leaf {}: status of '{}' at {}: {verdict}",
            self.inner.addr,
            info.name,
            info.origin
        );
        Ok(verdict)
    }
}
