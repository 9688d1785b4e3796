use crate::names::Name;
use crate::node::actor::NodeServerHandle;
use crate::node::InboundConnection;
use crate::tcpros::{self, ConnectionHeader, TcpRosError};
use crate::TCPROS_TIMEOUT;
use abort_on_drop::ChildTask;
use log::*;
use std::sync::Arc;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, watch},
    time::timeout,
};

/// The type-erased body handler one advertised service runs: wire bytes in,
/// wire bytes out.
pub(crate) type ServiceCallback = Arc<
    dyn Fn(Vec<u8>) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
>;

/// Handle to an advertised service. Dropping it unadvertises the service.
pub struct ServiceServer {
    service_name: String,
    node_handle: NodeServerHandle,
}

impl ServiceServer {
    pub(crate) fn new(service_name: String, node_handle: NodeServerHandle) -> Self {
        Self {
            service_name,
            node_handle,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        let _ = self.node_handle.unadvertise_service(&self.service_name);
    }
}

/// The registry-side record of one advertised service.
///
/// Connections arrive pre-classified from the node's TCPROS listener; each
/// gets its own task running the call loop until the client goes away (after
/// one exchange for non-persistent clients).
pub(crate) struct ServiceServerLink {
    service_type: String,
    connection_sender: mpsc::UnboundedSender<InboundConnection>,
    _accept_task: ChildTask<()>,
}

impl ServiceServerLink {
    pub(crate) fn new(
        node_name: &Name,
        service_name: &str,
        service_type: &str,
        md5sum: &str,
        callback: ServiceCallback,
        exit: watch::Receiver<bool>,
    ) -> Self {
        let responding_header = ConnectionHeader {
            caller_id: node_name.to_string(),
            topic_type: service_type.to_owned(),
            md5sum: Some(md5sum.to_owned()),
            request_type: Some(format!("{}Request", service_type)),
            response_type: Some(format!("{}Response", service_type)),
            ..Default::default()
        };

        let (connection_sender, mut connection_receiver) =
            mpsc::unbounded_channel::<InboundConnection>();
        let service_name_copy = service_name.to_owned();
        let accept_task = tokio::spawn(async move {
            debug!("Accept task has started for service: {service_name_copy}");
            while let Some(connection) = connection_receiver.recv().await {
                let callback = callback.clone();
                let responding_header = responding_header.clone();
                let exit = exit.clone();
                let service_name = service_name_copy.clone();
                // Each client gets its own call loop; the admission permit
                // rides along and frees the pool slot when the loop ends.
                tokio::spawn(async move {
                    Self::client_loop(connection, responding_header, callback, exit, service_name)
                        .await;
                });
            }
        });

        Self {
            service_type: service_type.to_owned(),
            connection_sender,
            _accept_task: accept_task.into(),
        }
    }

    pub(crate) fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Hands an accepted, already-classified connection to the accept task.
    pub(crate) fn bind(&self, connection: InboundConnection) {
        if self.connection_sender.send(connection).is_err() {
            warn!("service is shutting down, dropping an inbound client");
        }
    }

    async fn client_loop(
        connection: InboundConnection,
        responding_header: ConnectionHeader,
        callback: ServiceCallback,
        mut exit: watch::Receiver<bool>,
        service_name: String,
    ) {
        let InboundConnection {
            header,
            mut stream,
            permit: _permit,
        } = connection;

        // Server-side service allowances: a missing type and the wildcard
        // md5sum are accepted; anything else must match exactly.
        if let Err(reason) = check_service_header(&header, &responding_header, &service_name) {
            warn!("{reason}");
            let reply = ConnectionHeader::error_reply(
                reason,
                &responding_header.topic_type,
                responding_header.md5sum.as_deref().unwrap_or("*"),
            );
            let _ = tcpros::send_header(&mut stream, &reply, false).await;
            let _ = stream.shutdown().await;
            return;
        }

        if timeout(
            TCPROS_TIMEOUT,
            tcpros::send_header(&mut stream, &responding_header, false),
        )
        .await
        .map(|sent| sent.is_err())
        .unwrap_or(true)
        {
            warn!("Failed to answer a service handshake for {service_name}");
            return;
        }

        if header.probe {
            debug!("Probe connection for {service_name} closed after the handshake");
            let _ = stream.shutdown().await;
            return;
        }

        debug!(
            "Service client {:?} connected to {} (persistent={})",
            header.caller_id, service_name, header.persistent
        );
        loop {
            let request = tokio::select! {
                _ = exit.changed() => {
                    if *exit.borrow() {
                        debug!("Service worker for {service_name} exiting on node shutdown");
                        break;
                    }
                    continue;
                }
                request = tcpros::read_message(&mut stream) => request,
            };
            let request = match request {
                Ok(bytes) => bytes,
                Err(TcpRosError::Eof) => break,
                Err(err) => {
                    warn!("Error reading a service request for {service_name}: {err}");
                    break;
                }
            };

            match callback(request) {
                Ok(response) => {
                    let mut reply = Vec::with_capacity(response.len() + 1);
                    reply.push(1u8);
                    reply.extend_from_slice(&response);
                    if let Err(err) = stream.write_all(&reply).await {
                        warn!("Failed to send a service response for {service_name}: {err}");
                        break;
                    }
                }
                Err(err) => {
                    // status byte 0 followed by the error text record
                    let text = err.to_string();
                    debug!("Service handler for {service_name} failed: {text}");
                    let _ = stream.write_u8(0).await;
                    let _ = tcpros::write_frame(&mut stream, text.as_bytes()).await;
                    break;
                }
            }

            if !header.persistent {
                break;
            }
        }
        let _ = stream.shutdown().await;
    }
}

fn check_service_header(
    received: &ConnectionHeader,
    local: &ConnectionHeader,
    service_name: &str,
) -> Result<(), String> {
    if let Some(md5sum) = &received.md5sum {
        if md5sum != "*" && Some(md5sum) != local.md5sum.as_ref() {
            return Err(format!(
                "md5sums do not match for {}: expected {:?}, received {:?}",
                service_name, local.md5sum, md5sum
            ));
        }
    }
    if !received.topic_type.is_empty()
        && received.topic_type != "*"
        && received.topic_type != local.topic_type
    {
        return Err(format!(
            "service types do not match for {}: expected {:?}, received {:?}",
            service_name, local.topic_type, received.topic_type
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn local_header() -> ConnectionHeader {
        ConnectionHeader {
            caller_id: "/me".to_owned(),
            topic_type: "rospy_tutorials/AddTwoInts".to_owned(),
            md5sum: Some("6a2e34150c00229791cc89ff309fff21".to_owned()),
            request_type: Some("rospy_tutorials/AddTwoIntsRequest".to_owned()),
            response_type: Some("rospy_tutorials/AddTwoIntsResponse".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn wildcard_and_missing_fields_are_accepted() {
        let local = local_header();
        let received = ConnectionHeader {
            caller_id: "/cli".to_owned(),
            service: Some("/add_two_ints".to_owned()),
            md5sum: Some("*".to_owned()),
            ..Default::default()
        };
        assert!(check_service_header(&received, &local, "/add_two_ints").is_ok());
    }

    #[test]
    fn mismatched_md5_is_rejected() {
        let local = local_header();
        let received = ConnectionHeader {
            caller_id: "/cli".to_owned(),
            service: Some("/add_two_ints".to_owned()),
            md5sum: Some("0000000000000000000000000000dead".to_owned()),
            ..Default::default()
        };
        assert!(check_service_header(&received, &local, "/add_two_ints").is_err());
    }
}
