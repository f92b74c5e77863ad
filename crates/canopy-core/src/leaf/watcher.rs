// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! `owned/` directory watcher.
//!
//! Change detection is a periodic name+mtime snapshot diff. `downloads/` is
//! deliberately not watched: replicas may only change through protocol
//! actions (download overwrite, invalidate-driven delete).

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use tokio::task::JoinHandle;

use crate::codec::{valid_file_name, FileInfo};

use super::LeafHandle;

impl LeafHandle {
    /// Spawn the watcher task. Created files are registered, deletions are
    /// deregistered (which floods an invalidate under push), modifications
    /// bump the version (likewise flooding under push).
    pub fn spawn_watcher(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let shutdown = self.inner.shutdown.notified();
            tokio::pin!(shutdown);
            let mut previous = snapshot(&self.inner.owned_dir).await.unwrap_or_default();
            let mut tick = tokio::time::interval(self.inner.watch_interval);
            tick.tick().await; // the immediate first tick

            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tick.tick() => {}
                }

                let current = match snapshot(&self.inner.owned_dir).await {
                    Ok(current) => current,
                    Err(err) => {
                        tracing::warn!(
                            "leaf {}: could not scan owned directory: {err}",
                            self.inner.addr
                        );
                        continue;
                    }
                };

                for name in previous.keys() {
                    if !current.contains_key(name) {
                        tracing::info!("leaf {}: owned '{name}' deleted", self.inner.addr);
                        if let Err(err) = self.deregister(name).await {
                            tracing::warn!(
                                "leaf {}: deregister of deleted '{name}' failed: {err:#}",
                                self.inner.addr
                            );
                        }
                    }
                }

                for (name, modified) in &current {
                    match previous.get(name) {
                        None => {
                            tracing::info!("leaf {}: owned '{name}' created", self.inner.addr);
                            let file = FileInfo::owned(name, self.inner.addr.clone());
                            if let Err(err) = self.register(file).await {
                                tracing::warn!(
                                    "leaf {}: register of new '{name}' failed: {err:#}",
                                    self.inner.addr
                                );
                            }
                        }
                        Some(seen) if seen != modified => {
                            if let Err(err) = self.note_modified(name).await {
                                tracing::warn!(
                                    "leaf {}: version bump of '{name}' failed: {err:#}",
                                    self.inner.addr
                                );
                            }
                        }
                        Some(_) => {}
                    }
                }

                previous = current;
            }
            tracing::info!("leaf {}: watcher stopped", self.inner.addr);
        })
    }
}

/// Name -> mtime for every shareable regular file directly under `dir`.
async fn snapshot(dir: &Path) -> std::io::Result<HashMap<String, SystemTime>> {
    let mut out = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(meta) = entry.metadata().await else {
            continue; // raced with a delete
        };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !valid_file_name(&name) {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        out.insert(name, modified);
    }
    Ok(out)
}
