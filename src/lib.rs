//! # mux-network
//!
//! A multiplexed network transport: many prioritised message streams between
//! two participants, over TCP, UDP, QUIC or an in-process channel.
//!
//! ## Layers
//! - [`network::Network`]: listeners, dialing and the participant registry
//! - [`participant::Participant`]: one remote peer, its streams and events
//! - [`stream::Stream`]: typed send/receive with per-stream [`Promises`]
//! - [`protocol`]: handshake, priority queues, reliability, bandwidth
//! - [`core`]: identifiers, wire frames and the message envelope
//! - [`transport`]: the physical connections
//!
//! ## Example
//! ```rust,no_run
//! use mux_network::{ConnectAddr, ListenAddr, Network, NetworkConfig, Pid, Promises, StreamParams};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Network::new(Pid::new(), NetworkConfig::default())?;
//!     let client = Network::new(Pid::new(), NetworkConfig::default())?;
//!     server.listen(ListenAddr::Tcp("127.0.0.1:14004".parse()?)).await?;
//!
//!     let remote = client.connect(ConnectAddr::Tcp("127.0.0.1:14004".parse()?)).await?;
//!     let stream = remote.open(StreamParams::new(Promises::ORDERED)).await?;
//!     stream.send("ping").await?;
//!
//!     let accepted = server.connected().await?;
//!     let incoming = accepted.opened().await?;
//!     assert_eq!(incoming.recv::<String>().await?, "ping");
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod participant;
pub mod protocol;
pub mod scheduler;
pub mod stream;
pub mod transport;
pub mod utils;

pub use crate::channel::{Channel, ChannelInfo};
pub use crate::config::NetworkConfig;
pub use crate::core::message::Message;
pub use crate::core::types::{
    HandshakeFeatures, Pid, Prio, Promises, Secret, Sid, StreamParams, VELOREN_NETWORK_VERSION,
};
pub use crate::network::{Network, NetworkEvent};
pub use crate::participant::{BandwidthSample, Participant, ParticipantEvent};
pub use crate::stream::Stream;
pub use crate::transport::{ConnectAddr, ListenAddr, ProtocolKind};
pub use crate::utils::{Metrics, MetricsSnapshot};
