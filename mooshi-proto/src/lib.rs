//! Mooshimeter wire protocol - node tree, value codec and framing
//!
//! The meter models all of its settings and readings as a tree of typed
//! nodes. Every addressable node has a one-byte op-code; frames carry an
//! op-code plus a value encoded according to the node's type.
//!
//! This crate is pure: no I/O, no async. The session that drives a real
//! (or simulated) meter lives in `mooshi-client`.

pub mod ble;
pub mod crc;
pub mod description;
mod error;
pub mod frame;
pub mod opcode;
pub mod tree;
pub mod value;

pub use crc::{Crc32, CrcParams, CRC32_CHECK_VALUE};
pub use description::NodeSpec;
pub use error::ProtoError;
pub use frame::{Frame, FrameReader, PayloadKind};
pub use opcode::{OpCodeTable, WRITE_FLAG};
pub use tree::{Node, NodeId, SubscriptionId, Tree};
pub use value::{NodeType, Value, decode, encode};
