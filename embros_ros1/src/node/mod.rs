//! The node: its actor, lifecycle state machine, Slave XMLRPC server and
//! TCPROS listener.

pub(crate) mod actor;
mod handle;
mod tcpros_server;
mod xmlrpc_server;

pub use handle::{NodeHandle, ParamSubscriber};

use crate::tcpros::ConnectionHeader;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

/// Lifecycle states of a node.
///
/// A node is built `Uninit`, becomes `Idle` once configured, walks
/// `Startup` -> `Running` while it can see the Master, drops to `Shutdown`
/// on Master loss or an external shutdown, and returns to `Startup`
/// (re-discovery) or `Idle` (final) from there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Uninit,
    Idle,
    Startup,
    Running,
    Shutdown,
}

/// An accepted TCPROS connection after its client handshake has been read,
/// on its way to the publication or service it names. The admission permit
/// rides along and frees a worker slot when the connection is done.
pub(crate) struct InboundConnection {
    pub(crate) header: ConnectionHeader,
    pub(crate) stream: TcpStream,
    pub(crate) permit: OwnedSemaphorePermit,
}

/// Worker slots for inbound Slave XMLRPC requests.
pub(crate) const SLAVE_POOL_SIZE: usize = 8;
/// Worker slots for inbound TCPROS connections (subscribers + service clients).
pub(crate) const TCPROS_SERVER_POOL_SIZE: usize = 32;
/// Worker slots for outbound TCPROS connections (publisher links).
pub(crate) const TCPROS_CLIENT_POOL_SIZE: usize = 32;
