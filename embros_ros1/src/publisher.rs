use crate::names::Name;
use crate::node::actor::NodeServerHandle;
use crate::node::InboundConnection;
use crate::tcpros::{self, ConnectionHeader};
use abort_on_drop::ChildTask;
use embros_common::RosMessageType;
use log::*;
use std::{marker::PhantomData, sync::Arc};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, watch, RwLock},
};

/// The regular Publisher representation returned by calling advertise on a
/// [crate::NodeHandle].
pub struct Publisher<T> {
    topic_name: String,
    sender: mpsc::Sender<Vec<u8>>,
    phantom: PhantomData<T>,
}

impl<T: RosMessageType> Publisher<T> {
    pub(crate) fn new(topic_name: &str, sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            topic_name: topic_name.to_owned(),
            sender,
            phantom: PhantomData,
        }
    }

    /// Queues a message to be sent on the related topic.
    /// Returns when the data has been queued, not when it is actually sent.
    pub async fn publish(&self, data: &T) -> Result<(), PublisherError> {
        let data = serde_rosmsg::to_vec(&data)?;
        self.sender
            .send(data)
            .await
            .map_err(|_| PublisherError::StreamClosed)?;
        debug!("Publishing data on topic {}", self.topic_name);
        Ok(())
    }
}

/// A specialty publisher used when the message type is not known at compile
/// time. Relies on the user to provide serialized data, body length included
/// as the first four bytes.
pub struct PublisherAny {
    topic_name: String,
    sender: mpsc::Sender<Vec<u8>>,
}

impl PublisherAny {
    pub(crate) fn new(topic_name: &str, sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            topic_name: topic_name.to_owned(),
            sender,
        }
    }

    /// Queues raw wire bytes to be sent on the related topic.
    pub async fn publish(&self, data: Vec<u8>) -> Result<(), PublisherError> {
        self.sender
            .send(data)
            .await
            .map_err(|_| PublisherError::StreamClosed)?;
        debug!("Publishing raw data on topic {}", self.topic_name);
        Ok(())
    }
}

/// The registry-side record of one advertised topic.
///
/// Incoming subscriber connections arrive pre-classified from the node's
/// TCPROS listener; the accept task validates their handshake against this
/// publication and either binds the stream or answers with an error header.
pub(crate) struct Publication {
    topic_type: String,
    connection_sender: mpsc::UnboundedSender<InboundConnection>,
    publish_sender: mpsc::WeakSender<Vec<u8>>,
    _accept_task: ChildTask<()>,
    _publish_task: ChildTask<()>,
}

impl Publication {
    /// Spawns a new publication and the task pair that runs it.
    /// Dropping the returned Sender (and every clone handed to Publishers)
    /// eventually results in the publication being dropped and unadvertised.
    pub(crate) fn new(
        node_name: &Name,
        latching: bool,
        topic_name: &str,
        queue_size: usize,
        msg_definition: &str,
        md5sum: &str,
        topic_type: &str,
        node_handle: NodeServerHandle,
        exit: watch::Receiver<bool>,
    ) -> (Self, mpsc::Sender<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel::<Vec<u8>>(queue_size);
        let (connection_sender, connection_receiver) = mpsc::unbounded_channel();

        let responding_conn_header = ConnectionHeader {
            caller_id: node_name.to_string(),
            latching,
            msg_definition: msg_definition.to_owned(),
            md5sum: Some(md5sum.to_owned()),
            topic: Some(topic_name.to_owned()),
            topic_type: topic_type.to_owned(),
            ..Default::default()
        };
        trace!("Publisher connection header: {responding_conn_header:?}");

        let subscriber_streams = Arc::new(RwLock::new(Vec::new()));
        let last_message = Arc::new(RwLock::new(None));

        let accept_task = tokio::spawn(Self::accept_task(
            connection_receiver,
            subscriber_streams.clone(),
            topic_name.to_owned(),
            responding_conn_header,
            last_message.clone(),
            exit,
        ));

        let publish_task = tokio::spawn(Self::publish_task(
            receiver,
            subscriber_streams,
            last_message,
            node_handle,
            topic_name.to_owned(),
        ));

        let publication = Self {
            topic_type: topic_type.to_owned(),
            connection_sender,
            publish_sender: sender.downgrade(),
            _accept_task: accept_task.into(),
            _publish_task: publish_task.into(),
        };
        (publication, sender)
    }

    // Note: this returns Option<> due to a timing edge case
    // There can be a delay between when the last sender is dropped and when
    // the publication is dropped
    pub(crate) fn get_sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.publish_sender.clone().upgrade()
    }

    pub(crate) fn topic_type(&self) -> &str {
        &self.topic_type
    }

    /// Hands an accepted, already-classified connection to the accept task.
    pub(crate) fn bind(&self, connection: InboundConnection) {
        if self.connection_sender.send(connection).is_err() {
            warn!("publication is shutting down, dropping an inbound subscriber");
        }
    }

    /// Pulls messages from the publish queue and copies them to every bound
    /// subscriber stream, dropping streams that fail.
    async fn publish_task(
        mut rx: mpsc::Receiver<Vec<u8>>,
        subscriber_streams: Arc<RwLock<Vec<SubscriberStream>>>,
        last_message: Arc<RwLock<Option<Vec<u8>>>>,
        node_handle: NodeServerHandle,
        topic: String,
    ) {
        debug!("Publish task has started for publication: {topic}");
        loop {
            match rx.recv().await {
                Some(msg_to_publish) => {
                    trace!("Publish task got message to publish for topic: {topic}");
                    let mut streams = subscriber_streams.write().await;
                    let mut streams_to_remove = vec![];
                    for (stream_idx, subscriber) in streams.iter_mut().enumerate() {
                        if let Err(err) = subscriber.stream.write_all(&msg_to_publish[..]).await {
                            debug!("Failed to send data to subscriber: {err}, removing");
                            streams_to_remove.push(stream_idx);
                        }
                    }
                    // Subtract the removed count to account for shifting
                    // indices after each remove; indices are ascending here.
                    streams_to_remove.into_iter().enumerate().for_each(
                        |(removed_cnt, stream_idx)| {
                            streams.remove(stream_idx - removed_cnt);
                        },
                    );

                    *last_message.write().await = Some(msg_to_publish);
                }
                None => {
                    debug!(
                        "No more senders for the publisher channel, triggering publication cleanup"
                    );
                    // Tell the node server to dispose of this publication and
                    // unadvertise it. Done in a spawned task: dropping the
                    // publication cancels this very task, so awaiting inline
                    // would race with our own teardown.
                    let nh_copy = node_handle.clone();
                    let topic = topic.clone();
                    tokio::spawn(async move {
                        let _ = nh_copy.unregister_publisher(&topic).await;
                    });
                    break;
                }
            }
        }
        debug!("Publish task has exited for publication: {topic}");
    }

    /// Validates inbound subscriber handshakes against this publication and
    /// binds the surviving streams.
    async fn accept_task(
        mut connections: mpsc::UnboundedReceiver<InboundConnection>,
        subscriber_streams: Arc<RwLock<Vec<SubscriberStream>>>,
        topic_name: String,
        responding_conn_header: ConnectionHeader,
        last_message: Arc<RwLock<Option<Vec<u8>>>>,
        mut exit: watch::Receiver<bool>,
    ) {
        debug!("Accept task has started for publication: {topic_name}");
        loop {
            let connection = tokio::select! {
                _ = exit.changed() => {
                    if *exit.borrow() {
                        // Shutdown sweep: every bound subscriber stream is
                        // closed; the publication itself survives so it can
                        // be re-registered after Master re-discovery.
                        let dropped = subscriber_streams.write().await.drain(..).count();
                        debug!("Closed {dropped} subscriber streams for {topic_name}");
                    }
                    continue;
                }
                connection = connections.recv() => connection,
            };
            let Some(connection) = connection else {
                break;
            };
            let InboundConnection {
                header,
                mut stream,
                permit,
            } = connection;
            debug!(
                "Received subscribe request for {:?} from {:?} with md5sum {:?}",
                header.topic, header.caller_id, header.md5sum
            );

            // Topic handshakes have no wildcard allowance: the md5sum and
            // type have to match ours byte for byte.
            if let Err(reason) =
                check_subscriber_header(&header, &responding_conn_header, &topic_name)
            {
                warn!("{reason}");
                let reply = ConnectionHeader::error_reply(
                    reason,
                    &responding_conn_header.topic_type,
                    responding_conn_header.md5sum.as_deref().unwrap_or("*"),
                );
                if let Err(err) = tcpros::send_header(&mut stream, &reply, false).await {
                    debug!("Failed to send error header: {err}");
                }
                let _ = stream.shutdown().await;
                continue;
            }

            if header.tcp_nodelay {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {err}");
                }
            }

            // Write our own connection header in response.
            if let Err(err) =
                tcpros::send_header(&mut stream, &responding_conn_header, false).await
            {
                error!("Unable to respond on tcpstream: {err}");
                continue;
            }

            if header.probe {
                // A capability query: the connection existed only to let the
                // peer verify type compatibility.
                debug!("Probe connection for {topic_name} closed after the handshake");
                let _ = stream.shutdown().await;
                continue;
            }

            // If we're configured to latch, send the last message to the new
            // subscriber before it joins the stream list.
            if responding_conn_header.latching {
                if let Some(last_message) = last_message.read().await.as_ref() {
                    debug!("Publication is latching and has a last message, sending");
                    if let Err(err) = stream.write_all(last_message).await {
                        error!("Failed to send latch message to subscriber: {err:?}");
                        continue;
                    }
                }
            }

            let mut wlock = subscriber_streams.write().await;
            wlock.push(SubscriberStream {
                stream,
                _permit: permit,
            });
            debug!(
                "Added stream for topic {:?} to subscriber {}",
                header.topic, header.caller_id
            );
        }
        debug!("Accept task has exited for publication: {topic_name}");
    }
}

/// A bound subscriber stream; its admission permit is released when the
/// stream is dropped.
struct SubscriberStream {
    stream: TcpStream,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

fn check_subscriber_header(
    received: &ConnectionHeader,
    local: &ConnectionHeader,
    topic_name: &str,
) -> Result<(), String> {
    if received.md5sum != local.md5sum {
        return Err(format!(
            "md5sums do not match for {}: expected {:?}, received {:?}",
            topic_name, local.md5sum, received.md5sum
        ));
    }
    if received.topic_type != local.topic_type {
        return Err(format!(
            "topic types do not match for {}: expected {:?}, received {:?}",
            topic_name, local.topic_type, received.topic_type
        ));
    }
    Ok(())
}

impl Drop for Publication {
    fn drop(&mut self) {
        debug!("Dropping publication for topic {}", self.topic_type);
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    /// Serialize Error from `serde_rosmsg::Error` (stored as String because of dyn Error)
    #[error("serde_rosmsg Error: {0}")]
    SerializingError(String),
    #[error("connection closed, no further messages can be sent")]
    StreamClosed,
}

impl From<serde_rosmsg::Error> for PublisherError {
    fn from(value: serde_rosmsg::Error) -> Self {
        Self::SerializingError(value.to_string())
    }
}

impl From<PublisherError> for embros_common::Error {
    fn from(value: PublisherError) -> Self {
        match value {
            PublisherError::SerializingError(msg) => embros_common::Error::SerializationError(msg),
            PublisherError::StreamClosed => embros_common::Error::Disconnected,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn local_header() -> ConnectionHeader {
        ConnectionHeader {
            caller_id: "/me".to_owned(),
            topic: Some("/chatter".to_owned()),
            topic_type: "std_msgs/String".to_owned(),
            md5sum: Some("992ce8a1687cec8c8bd883ec73ca41d1".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn only_exact_headers_bind() {
        let local = local_header();
        let mut received = local.clone();
        received.caller_id = "/pub".to_owned();
        assert!(check_subscriber_header(&received, &local, "/chatter").is_ok());

        // The wildcard allowance is a service-side thing; topic handshakes
        // match exactly or not at all.
        let mut received = local.clone();
        received.md5sum = Some("*".to_owned());
        assert!(check_subscriber_header(&received, &local, "/chatter").is_err());

        let mut received = local.clone();
        received.topic_type = "*".to_owned();
        assert!(check_subscriber_header(&received, &local, "/chatter").is_err());

        let mut received = local.clone();
        received.md5sum = None;
        assert!(check_subscriber_header(&received, &local, "/chatter").is_err());

        let mut received = local.clone();
        received.topic_type = String::new();
        assert!(check_subscriber_header(&received, &local, "/chatter").is_err());
    }

    #[test]
    fn mismatched_headers_are_rejected() {
        let local = local_header();
        let mut received = local.clone();
        received.md5sum = Some("992ce8a1687cec8c8bd883ec73ca41d2".to_owned());
        assert!(check_subscriber_header(&received, &local, "/chatter").is_err());

        let mut received = local.clone();
        received.topic_type = "std_msgs/Int32".to_owned();
        assert!(check_subscriber_header(&received, &local, "/chatter").is_err());
    }
}
