//! The node-wide TCPROS listener.
//!
//! One listener serves every advertised topic and service: an accepted
//! connection is admitted through the server worker pool, its client
//! handshake is read, and the connection is routed to the publication or
//! service it names. The actor answers unroutable handshakes with an error
//! header.

use super::actor::NodeServerHandle;
use super::InboundConnection;
use crate::pool::WorkerPool;
use crate::tcpros::{self, ConnectionHeader};
use crate::TCPROS_TIMEOUT;
use log::*;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

pub(crate) async fn run(
    listener: TcpListener,
    handle: NodeServerHandle,
    pool: WorkerPool,
    mut node_exit: watch::Receiver<bool>,
) {
    debug!("TCPROS listener running");
    loop {
        tokio::select! {
            _ = node_exit.changed() => {
                if *node_exit.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("TCPROS accept failed: {err}");
                        continue;
                    }
                };
                trace!("TCPROS connection from {peer}");
                let Some(permit) = pool.try_admit() else {
                    // Pool exhausted: close and move on.
                    drop(stream);
                    continue;
                };
                let handle = handle.clone();
                tokio::spawn(async move {
                    handshake_worker(stream, permit, handle).await;
                });
            }
        }
    }
    debug!("TCPROS listener exited");
}

/// Reads the client handshake off a fresh connection and routes it.
async fn handshake_worker(
    mut stream: TcpStream,
    permit: tokio::sync::OwnedSemaphorePermit,
    handle: NodeServerHandle,
) {
    let header = match timeout(TCPROS_TIMEOUT, tcpros::receive_header(&mut stream, false)).await {
        Ok(Ok(header)) => header,
        Ok(Err(err)) => {
            debug!("Bad TCPROS handshake: {err}");
            send_error_reply(&mut stream, "could not parse the connection header").await;
            return;
        }
        Err(_) => {
            debug!("TCPROS handshake timed out");
            return;
        }
    };
    if handle
        .inbound(InboundConnection {
            header,
            stream,
            permit,
        })
        .is_err()
    {
        debug!("Node is gone, dropping an inbound TCPROS connection");
    }
}

pub(crate) async fn send_error_reply(stream: &mut TcpStream, reason: &str) {
    let reply = ConnectionHeader::error_reply(reason, "*", "*");
    if let Err(err) = tcpros::send_header(stream, &reply, false).await {
        trace!("Failed to send a TCPROS error header: {err}");
    }
    let _ = stream.shutdown().await;
}
