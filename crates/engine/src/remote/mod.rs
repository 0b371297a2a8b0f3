//! Calculation nodes running behind a connection.
//!
//! The dispatcher side runs a [`RemoteNodeServer`], which turns every node
//! that completes the `Ready` handshake into a [`RemoteNodeJobInvoker`]
//! registered with the dispatcher. The node side runs a [`RemoteNodeClient`]
//! in front of a [`LocalNodeJobInvoker`](crate::invoker::LocalNodeJobInvoker).

mod client;
mod invoker;
mod server;

pub use client::RemoteNodeClient;
pub use invoker::RemoteNodeJobInvoker;
pub use server::RemoteNodeServer;
