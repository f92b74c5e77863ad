// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! End-to-end overlay runs over localhost sockets.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::addr::PeerAddr;
use crate::codec::read_frame;
use crate::config::ConsistencyModel;
use crate::leaf::{Leaf, LeafConfig, LeafHandle};
use crate::superpeer::{SuperPeerConfig, SuperPeerHandle};
use crate::{FileInfo, Message};

async fn listener() -> (TcpListener, PeerAddr) {
    let socket = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let port = socket.local_addr().expect("local addr").port();
    (socket, PeerAddr::new("127.0.0.1", port))
}

/// Fresh working directory under the system temp dir, unique per listen
/// port so parallel tests never collide.
fn test_root(tag: &str, port: u16) -> PathBuf {
    let root = std::env::temp_dir().join(format!("canopy_{tag}_{port}"));
    let _ = std::fs::remove_dir_all(&root);
    root
}

fn seed_owned(root: &PathBuf, name: &str, bytes: &[u8]) {
    let owned = root.join("owned");
    std::fs::create_dir_all(&owned).expect("create owned dir");
    std::fs::write(owned.join(name), bytes).expect("seed owned file");
}

fn fast_leaf_config(
    addr: PeerAddr,
    super_peer: PeerAddr,
    root: PathBuf,
    model: ConsistencyModel,
) -> LeafConfig {
    let mut config = LeafConfig::new(addr, super_peer, root, model);
    config.watch_interval = Duration::from_millis(50);
    config.check_interval = Duration::from_millis(100);
    config
}

async fn start_leaf(
    addr: PeerAddr,
    super_peer: PeerAddr,
    root: PathBuf,
    model: ConsistencyModel,
    socket: TcpListener,
) -> LeafHandle {
    let leaf = Leaf::start(fast_leaf_config(addr, super_peer, root, model))
        .await
        .expect("start leaf");
    leaf.clone().spawn_listener(socket);
    leaf
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// One super-peer, two leaves, push model. A search on one leaf pulls the
/// file the other leaf owns into `downloads/`, byte for byte, and records
/// the true origin in the local registry.
#[tokio::test]
async fn single_hop_query_hit_downloads_file() {
    let (sp_socket, sp_addr) = listener().await;
    let (l1_socket, l1_addr) = listener().await;
    let (l2_socket, l2_addr) = listener().await;

    let sp = SuperPeerHandle::new(SuperPeerConfig {
        addr: sp_addr.clone(),
        neighbors: vec![],
        leaves: vec![l1_addr.clone(), l2_addr.clone()],
    });
    sp.clone().spawn_listener(sp_socket);

    let content = b"feature film bytes, version one".to_vec();
    let l2_root = test_root("single_hop_l2", l2_addr.port);
    seed_owned(&l2_root, "Coco.mp4", &content);
    let l2 = start_leaf(
        l2_addr.clone(),
        sp_addr.clone(),
        l2_root,
        ConsistencyModel::Push,
        l2_socket,
    )
    .await;

    let l1_root = test_root("single_hop_l1", l1_addr.port);
    let l1 = start_leaf(
        l1_addr.clone(),
        sp_addr.clone(),
        l1_root.clone(),
        ConsistencyModel::Push,
        l1_socket,
    )
    .await;

    l1.query("Coco.mp4").await.expect("query");

    eventually("download to complete", || async {
        l1.registry_entry("Coco.mp4").await.is_some()
    })
    .await;

    let entry = l1.registry_entry("Coco.mp4").await.expect("registry entry");
    assert_eq!(entry.origin, *l2.addr());
    assert_eq!(entry.version, 1);
    assert_eq!(entry.valid, Some(true));
    assert_eq!(entry.to_string(), format!("Coco.mp4,{},1,true", l2.addr()));

    let replica = std::fs::read(l1_root.join("downloads/Coco.mp4")).expect("replica on disk");
    assert_eq!(replica, content);
}

/// Three super-peers in a chain, two distinct owners. The querier sees an
/// offer from each side but performs exactly one download.
#[tokio::test]
async fn duplicate_offers_download_once() {
    let mut sp_sockets = Vec::new();
    let mut sp_addrs = Vec::new();
    for _ in 0..3 {
        let (socket, addr) = listener().await;
        sp_sockets.push(socket);
        sp_addrs.push(addr);
    }
    let (l1_socket, l1_addr) = listener().await;
    let (l2_socket, l2_addr) = listener().await;
    let (l3_socket, l3_addr) = listener().await;
    let leaf_sets = [
        vec![l1_addr.clone()],
        vec![l2_addr.clone()],
        vec![l3_addr.clone()],
    ];

    for (index, socket) in sp_sockets.into_iter().enumerate() {
        let mut neighbors = Vec::new();
        if index > 0 {
            neighbors.push(sp_addrs[index - 1].clone());
        }
        if index + 1 < sp_addrs.len() {
            neighbors.push(sp_addrs[index + 1].clone());
        }
        let sp = SuperPeerHandle::new(SuperPeerConfig {
            addr: sp_addrs[index].clone(),
            neighbors,
            leaves: leaf_sets[index].clone(),
        });
        sp.spawn_listener(socket);
    }

    let content = b"the same bytes on both owners".to_vec();
    let l2_root = test_root("dup_l2", l2_addr.port);
    seed_owned(&l2_root, "Coco.mp4", &content);
    start_leaf(
        l2_addr,
        sp_addrs[1].clone(),
        l2_root,
        ConsistencyModel::Push,
        l2_socket,
    )
    .await;

    let l3_root = test_root("dup_l3", l3_addr.port);
    seed_owned(&l3_root, "Coco.mp4", &content);
    start_leaf(
        l3_addr,
        sp_addrs[2].clone(),
        l3_root,
        ConsistencyModel::Push,
        l3_socket,
    )
    .await;

    let l1_root = test_root("dup_l1", l1_addr.port);
    let l1 = start_leaf(
        l1_addr,
        sp_addrs[0].clone(),
        l1_root.clone(),
        ConsistencyModel::Push,
        l1_socket,
    )
    .await;

    l1.query("Coco.mp4").await.expect("query");

    eventually("download to complete", || async {
        l1.registry_entry("Coco.mp4").await.is_some()
    })
    .await;
    // Give the second offer time to travel the long way around.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(l1.completed_transfers().await, 1);
    let replica = std::fs::read(l1_root.join("downloads/Coco.mp4")).expect("replica on disk");
    assert_eq!(replica, content);
}

/// Push model: modifying an owned file floods an invalidate that removes
/// the replica (registry entry and bytes) from the downloader.
#[tokio::test]
async fn push_invalidation_drops_replicas() {
    let (sp_socket, sp_addr) = listener().await;
    let (l1_socket, l1_addr) = listener().await;
    let (l2_socket, l2_addr) = listener().await;

    let sp = SuperPeerHandle::new(SuperPeerConfig {
        addr: sp_addr.clone(),
        neighbors: vec![],
        leaves: vec![l1_addr.clone(), l2_addr.clone()],
    });
    sp.clone().spawn_listener(sp_socket);

    let l2_root = test_root("push_inv_l2", l2_addr.port);
    seed_owned(&l2_root, "Coco.mp4", b"original cut");
    let l2 = start_leaf(
        l2_addr.clone(),
        sp_addr.clone(),
        l2_root.clone(),
        ConsistencyModel::Push,
        l2_socket,
    )
    .await;
    l2.clone().spawn_watcher();

    let l1_root = test_root("push_inv_l1", l1_addr.port);
    let l1 = start_leaf(
        l1_addr.clone(),
        sp_addr,
        l1_root.clone(),
        ConsistencyModel::Push,
        l1_socket,
    )
    .await;

    l1.query("Coco.mp4").await.expect("query");
    eventually("replica announced at the super-peer", || async {
        sp.holders("Coco.mp4").await.contains(&l1_addr)
    })
    .await;

    // Directory mtimes can be coarse; put the modification clearly after
    // the watcher's baseline snapshot.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    std::fs::write(l2_root.join("owned/Coco.mp4"), b"director's cut").expect("modify owned file");

    eventually("replica to be invalidated", || async {
        l1.registry_entry("Coco.mp4").await.is_none()
    })
    .await;
    eventually("replica bytes to be deleted", || async {
        !l1_root.join("downloads/Coco.mp4").exists()
    })
    .await;

    // The origin keeps its own file and the bumped version.
    let origin_entry = l2.registry_entry("Coco.mp4").await.expect("origin entry");
    assert!(origin_entry.version >= 2);
    assert!(l2_root.join("owned/Coco.mp4").exists());
}

/// Pull model: a stale replica is noticed by the status probe, deregistered
/// but kept on disk, and a refresh downloads the new version.
#[tokio::test]
async fn pull_outdated_probe_then_refresh() {
    let (sp_socket, sp_addr) = listener().await;
    let (l1_socket, l1_addr) = listener().await;
    let (l2_socket, l2_addr) = listener().await;
    let model = ConsistencyModel::Pull { ttr_minutes: 0 };

    let sp = SuperPeerHandle::new(SuperPeerConfig {
        addr: sp_addr.clone(),
        neighbors: vec![],
        leaves: vec![l1_addr.clone(), l2_addr.clone()],
    });
    sp.clone().spawn_listener(sp_socket);

    let l2_root = test_root("pull_out_l2", l2_addr.port);
    seed_owned(&l2_root, "Coco.mp4", b"version one");
    let l2 = start_leaf(l2_addr, sp_addr.clone(), l2_root.clone(), model, l2_socket).await;

    let l1_root = test_root("pull_out_l1", l1_addr.port);
    let l1 = start_leaf(l1_addr, sp_addr, l1_root.clone(), model, l1_socket).await;
    l1.clone().spawn_checker();

    l1.query("Coco.mp4").await.expect("query");
    eventually("download to complete", || async {
        l1.registry_entry("Coco.mp4").await.is_some()
    })
    .await;

    // The origin moves to version two; replicas only find out by probing.
    std::fs::write(l2_root.join("owned/Coco.mp4"), b"version two").expect("modify owned file");
    l2.note_modified("Coco.mp4").await.expect("bump version");

    eventually("stale replica to be deregistered", || async {
        l1.registry_entry("Coco.mp4").await.is_none()
    })
    .await;
    // An outdated verdict preserves the bytes for the user.
    assert!(l1_root.join("downloads/Coco.mp4").exists());

    l1.refresh("Coco.mp4").await.expect("refresh");
    eventually("refresh to download version two", || async {
        matches!(
            l1.registry_entry("Coco.mp4").await,
            Some(entry) if entry.version == 2
        )
    })
    .await;
    let replica = std::fs::read(l1_root.join("downloads/Coco.mp4")).expect("replica on disk");
    assert_eq!(replica, b"version two");
}

/// Pull model: when the origin deregisters the file, the next probe removes
/// both the registry entry and the replica bytes.
#[tokio::test]
async fn pull_deleted_probe_removes_replica() {
    let (sp_socket, sp_addr) = listener().await;
    let (l1_socket, l1_addr) = listener().await;
    let (l2_socket, l2_addr) = listener().await;
    let model = ConsistencyModel::Pull { ttr_minutes: 0 };

    let sp = SuperPeerHandle::new(SuperPeerConfig {
        addr: sp_addr.clone(),
        neighbors: vec![],
        leaves: vec![l1_addr.clone(), l2_addr.clone()],
    });
    sp.clone().spawn_listener(sp_socket);

    let l2_root = test_root("pull_del_l2", l2_addr.port);
    seed_owned(&l2_root, "Coco.mp4", b"short lived");
    let l2 = start_leaf(l2_addr, sp_addr.clone(), l2_root, model, l2_socket).await;

    let l1_root = test_root("pull_del_l1", l1_addr.port);
    let l1 = start_leaf(l1_addr, sp_addr, l1_root.clone(), model, l1_socket).await;
    l1.clone().spawn_checker();

    l1.query("Coco.mp4").await.expect("query");
    eventually("download to complete", || async {
        l1.registry_entry("Coco.mp4").await.is_some()
    })
    .await;

    l2.deregister("Coco.mp4").await.expect("origin deregister");

    eventually("replica registry entry to go", || async {
        l1.registry_entry("Coco.mp4").await.is_none()
    })
    .await;
    eventually("replica bytes to go", || async {
        !l1_root.join("downloads/Coco.mp4").exists()
    })
    .await;
}

/// A query cannot produce a hit from an owner more hops away than its TTL.
#[tokio::test]
async fn ttl_cuts_off_distant_owners() {
    const HOPS: usize = 12;
    let mut sp_sockets = Vec::new();
    let mut sp_addrs = Vec::new();
    for _ in 0..HOPS {
        let (socket, addr) = listener().await;
        sp_sockets.push(socket);
        sp_addrs.push(addr);
    }
    let (l1_socket, l1_addr) = listener().await;
    let (l2_socket, l2_addr) = listener().await;

    for (index, socket) in sp_sockets.into_iter().enumerate() {
        let mut neighbors = Vec::new();
        if index > 0 {
            neighbors.push(sp_addrs[index - 1].clone());
        }
        if index + 1 < sp_addrs.len() {
            neighbors.push(sp_addrs[index + 1].clone());
        }
        let leaves = if index == 0 {
            vec![l1_addr.clone()]
        } else if index == HOPS - 1 {
            vec![l2_addr.clone()]
        } else {
            vec![]
        };
        let sp = SuperPeerHandle::new(SuperPeerConfig {
            addr: sp_addrs[index].clone(),
            neighbors,
            leaves,
        });
        sp.spawn_listener(socket);
    }

    let l2_root = test_root("ttl_l2", l2_addr.port);
    seed_owned(&l2_root, "Coco.mp4", b"too far away");
    start_leaf(
        l2_addr,
        sp_addrs[HOPS - 1].clone(),
        l2_root,
        ConsistencyModel::Push,
        l2_socket,
    )
    .await;

    let l1_root = test_root("ttl_l1", l1_addr.port);
    let l1 = start_leaf(
        l1_addr,
        sp_addrs[0].clone(),
        l1_root.clone(),
        ConsistencyModel::Push,
        l1_socket,
    )
    .await;

    l1.query("Coco.mp4").await.expect("query");
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(l1.completed_transfers().await, 0);
    assert!(l1.registry_entry("Coco.mp4").await.is_none());
    assert!(!l1_root.join("downloads/Coco.mp4").exists());
}

/// A super-peer processes a given message id at most once, however many
/// times the flood re-delivers it.
#[tokio::test]
async fn repeated_query_routes_once() {
    let (holder_socket, holder_addr) = listener().await;
    drop(holder_socket); // only the address matters, nothing connects to it
    let (source_socket, source_addr) = listener().await;

    let sp = SuperPeerHandle::new(SuperPeerConfig {
        addr: PeerAddr::new("127.0.0.1", 1),
        neighbors: vec![],
        leaves: vec![holder_addr.clone(), source_addr.clone()],
    });
    sp.register("Coco.mp4", &holder_addr).await;

    let hits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = source_socket.accept().await else {
                break;
            };
            let recorder = recorder.clone();
            tokio::spawn(async move {
                let (read_half, _write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let _ = read_frame(&mut reader).await; // handshake
                while let Ok(Some(line)) = read_frame(&mut reader).await {
                    recorder.lock().await.push(line);
                }
            });
        }
    });

    let msg = Message {
        id: format!("{source_addr}-1"),
        ttl: 0,
        file: FileInfo::owned("Coco.mp4", source_addr.clone()),
        sender: source_addr.clone(),
    };
    sp.route_query(msg.clone(), source_addr.clone()).await;
    sp.route_query(msg, source_addr).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let recorded = hits.lock().await;
    assert_eq!(recorded.len(), 1, "one queryhit for one recorded id");
    assert!(recorded[0].starts_with("queryhit "));
    assert_eq!(sp.history_len().await, 1);
}
