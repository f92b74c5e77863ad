pub mod addr;
pub mod codec;
pub mod config;
pub mod history;
pub mod leaf;
pub mod net;
pub mod superpeer;

pub use addr::PeerAddr;
pub use codec::{FileInfo, Frame, Message, StatusVerdict, WireError, MAX_FRAME_BYTES};
pub use config::{ConsistencyModel, Topology};
pub use history::{MessageHistory, HISTORY_CAPACITY};
pub use leaf::{Leaf, LeafConfig, LeafHandle, DEFAULT_TTL};
pub use superpeer::{SuperPeerConfig, SuperPeerHandle};

#[cfg(test)]
mod scenarios;
