//! Length-prefixed RPC transport.
//!
//! - [`envelope`]: the wire message and its framing
//! - [`buffer`]: growable read buffer and queued write buffer
//! - [`connection`]: one socket and its I/O task
//! - [`channel`]: the network loop multiplexing connections by id
//! - [`service`]: name-based dispatch of inbound requests
//!
//! Requests and responses are correlated by a per-connection request id,
//! so several calls may be outstanding on one link and complete in any
//! order. A call whose connection closes is abandoned: its continuation is
//! dropped without being invoked.

pub mod buffer;
pub mod channel;
pub mod connection;
pub mod envelope;
pub mod service;

pub use channel::{ConnectionObserver, RpcChannel, RpcHandle};
pub use connection::{Connection, ConnectionId, CLIENT_CONNECTION_ID};
pub use envelope::{Envelope, EnvelopeKind, FrameDecoder};
pub use service::{CallContext, Reply, ServiceRegistry};
