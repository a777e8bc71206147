//! Hubwire - bidirectional hub RPC over persistent duplex sockets.
//!
//! Servers expose typed methods on hub types; clients invoke them and get
//! correlated results back. Servers push invocations to one client, a group,
//! or everyone, through a backplane that can span processes.
//!
//! # Architecture
//!
//! - **Channel** - one duplex transport plus its framing and middleware chain
//! - **Hub** - user type whose registered methods clients call
//! - **Dispatcher** - server loop: lifecycle, decoding, authorization, results
//! - **Client** - call correlation, server-invocation handlers
//! - **Backplane** - fan-out by connection, group, or all (local or pub/sub)
//!
//! # Modules
//!
//! - [`protocol`] - wire envelope and invocation descriptors
//! - [`middleware`] - send/receive transform chain
//! - [`channel`] - transports and framing
//! - [`connection`] - connection handles and the registry
//! - [`hub`] - hub trait, method registry, dispatcher
//! - [`client`] - `HubConnection`
//! - [`backplane`] - group membership and fan-out
//! - [`config`] - configuration loading

// Library modules
pub mod backplane;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod hub;
pub mod middleware;
pub mod protocol;

// Re-export commonly used types
pub use backplane::{Backplane, LocalBackplane, PubSubBackplane};
pub use channel::{Channel, ChannelError, CloseStatus};
pub use client::{ClientError, HubConnection};
pub use config::Config;
pub use connection::{Connection, ConnectionId, ConnectionRegistry, Identity};
pub use hub::{Hub, HubContext, HubDispatcher, HubError, HubMethods};
pub use middleware::{Middleware, MiddlewarePipeline};
pub use protocol::{Message, MessageType};
