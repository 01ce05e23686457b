//! fmprpc core: framed msgpack RPC over a single duplex stream, with
//! per-call cancellation, optional payload compression and a client
//! connection that reconnects and retries on its own.

pub mod backoff;
pub mod calls;
pub mod client;
pub mod codec;
pub mod compress;
pub mod config;
pub mod conn_transport;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod sigpipe;
pub mod tls;
pub mod transport;

mod receiver;
mod writer;

pub use client::{Client, GenericClient, GenericClientExt};
pub use connection::{Connection, ConnectionHandler, ConnectionOpts, ConnectionTransport};
pub use context::Context;
pub use error::{Result, RpcError};
pub use message::{CompressionType, MessageType, SeqNumber};
pub use protocol::{HandlerDescription, Protocol};
pub use server::Server;
pub use transport::Transport;
