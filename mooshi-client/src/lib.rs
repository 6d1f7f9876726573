//! Mooshimeter client
//!
//! Drives a meter session over BLE: scan, connect, discover the node tree,
//! then read, write and watch nodes.
//!
//! # Example
//!
//! ```no_run
//! use mooshi_client::{BtleTransport, Session, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (transport, events) = BtleTransport::new();
//! let mut session = Session::new(Box::new(transport), events, SessionConfig::default());
//!
//! session
//!     .setup(
//!         |session| {
//!             if let Some(node) = session.node_find("CH1:VALUE", None) {
//!                 session
//!                     .node_subscribe(node, |session, node| {
//!                         println!("CH1 = {}", session.value_as_string(node));
//!                     })
//!                     .ok();
//!             }
//!         },
//!         |session| session.rescan(),
//!     )
//!     .await?;
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod ble;
pub mod config;
mod error;
pub mod session;
pub mod sim;
pub mod state;
pub mod transport;

pub use ble::BtleTransport;
pub use config::{SessionConfig, mooshi_home};
pub use error::{ErrorCode, SessionError, TransportError};
pub use session::{InitHandler, NodeHandler, ScanTimeoutHandler, Session};
pub use sim::{SimHandle, SimMeter};
pub use state::ConnectionState;
pub use transport::{
    AdapterInfo, CharacteristicId, DeviceId, EventReceiver, Property, Transport, TransportEvent,
};

pub use mooshi_proto as proto;
pub use mooshi_proto::{NodeId, NodeType, SubscriptionId, Value};
