use crate::names::Name;
use crate::pool::WorkerPool;
use crate::tcpros::{self, ConnectionHeader, TcpRosError};
use crate::xmlrpc::{self, code, XmlRpcError, XmlRpcValue};
use crate::TCPROS_TIMEOUT;
use abort_on_drop::ChildTask;
use embros_common::RosMessageType;
use log::*;
use std::{marker::PhantomData, sync::Arc};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{broadcast, watch, RwLock},
    time::timeout,
};

/// A typed stream of messages from one subscribed topic.
pub struct Subscriber<T> {
    receiver: broadcast::Receiver<Vec<u8>>,
    _phantom: PhantomData<T>,
}

impl<T: RosMessageType> Subscriber<T> {
    pub(crate) fn new(receiver: broadcast::Receiver<Vec<u8>>) -> Self {
        Self {
            receiver,
            _phantom: PhantomData,
        }
    }

    /// The next message, `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<Result<T, SubscriberError>> {
        let data = match self.receiver.recv().await {
            Ok(data) => data,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                return Some(Err(SubscriberError::Lagged(skipped)))
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        match serde_rosmsg::from_slice::<T>(&data[..]) {
            Ok(message) => Some(Ok(message)),
            Err(err) => Some(Err(SubscriberError::DeserializeError(err.to_string()))),
        }
    }
}

/// A type-erased subscriber yielding raw wire bytes (length prefix
/// included).
pub struct SubscriberAny {
    receiver: broadcast::Receiver<Vec<u8>>,
}

impl SubscriberAny {
    pub(crate) fn new(receiver: broadcast::Receiver<Vec<u8>>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<Result<Vec<u8>, SubscriberError>> {
        match self.receiver.recv().await {
            Ok(data) => Some(Ok(data)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(Err(SubscriberError::Lagged(skipped)))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SubscriberError {
    /// The subscriber fell behind and `skipped` messages were dropped.
    #[error("subscriber lagged, {0} messages were dropped")]
    Lagged(u64),
    #[error("serde_rosmsg Error: {0}")]
    DeserializeError(String),
}

impl From<SubscriberError> for embros_common::Error {
    fn from(value: SubscriberError) -> Self {
        embros_common::Error::SerializationError(value.to_string())
    }
}

/// The registry-side record of one subscribed topic.
///
/// Each remote publisher gets a client worker: it resolves the TCPROS
/// endpoint via the publisher's Slave API, performs the handshake, and
/// copies framed messages into the shared broadcast channel until the
/// connection dies or the node signals exit.
pub(crate) struct Subscription {
    subscription_tasks: Vec<ChildTask<()>>,
    _msg_receiver: broadcast::Receiver<Vec<u8>>,
    msg_sender: broadcast::Sender<Vec<u8>>,
    connection_header: ConnectionHeader,
    known_publishers: Arc<RwLock<Vec<String>>>,
    exit: watch::Receiver<bool>,
    pool: WorkerPool,
}

impl Subscription {
    pub(crate) fn new(
        node_name: &Name,
        topic_name: &str,
        topic_type: &str,
        md5sum: &str,
        queue_size: usize,
        exit: watch::Receiver<bool>,
        pool: WorkerPool,
    ) -> Self {
        let (sender, receiver) = broadcast::channel(queue_size);
        let connection_header = ConnectionHeader {
            caller_id: node_name.to_string(),
            topic: Some(topic_name.to_owned()),
            topic_type: topic_type.to_owned(),
            md5sum: Some(md5sum.to_owned()),
            ..Default::default()
        };

        Self {
            subscription_tasks: vec![],
            _msg_receiver: receiver,
            msg_sender: sender,
            connection_header,
            known_publishers: Arc::new(RwLock::new(vec![])),
            exit,
            pool,
        }
    }

    pub(crate) fn topic_type(&self) -> &str {
        self.connection_header.topic_type.as_str()
    }

    pub(crate) fn get_receiver(&self) -> broadcast::Receiver<Vec<u8>> {
        self.msg_sender.subscribe()
    }

    /// Spawns a client worker for `publisher_uri` unless one is already
    /// streaming from it. Used both for the publisher list returned by
    /// `registerSubscriber` and for later `publisherUpdate` callbacks; the
    /// set difference falls out of the known-publishers check.
    pub(crate) async fn add_publisher_source(&mut self, publisher_uri: &str) {
        let is_new_connection = {
            !self
                .known_publishers
                .read()
                .await
                .iter()
                .any(|publisher| publisher.as_str() == publisher_uri)
        };
        if !is_new_connection {
            return;
        }

        let topic_name = self.connection_header.topic.clone().unwrap_or_default();
        let connection_header = self.connection_header.clone();
        let sender = self.msg_sender.clone();
        let publisher_list = self.known_publishers.clone();
        let publisher_uri = publisher_uri.to_owned();
        let mut exit = self.exit.clone();
        let pool = self.pool.clone();

        let handle = tokio::spawn(async move {
            let permit = pool.admit().await;
            let mut stream = match establish_publisher_connection(
                &topic_name,
                &publisher_uri,
                connection_header,
            )
            .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to connect to publisher {publisher_uri} for {topic_name}: {err}");
                    return;
                }
            };
            publisher_list.write().await.push(publisher_uri.clone());

            loop {
                tokio::select! {
                    _ = exit.changed() => {
                        if *exit.borrow() {
                            debug!("Subscription worker for {topic_name} exiting on node shutdown");
                            break;
                        }
                    }
                    message = tcpros::read_message(&mut stream) => match message {
                        Ok(bytes) => {
                            if sender.send(bytes).is_err() {
                                debug!("All receivers for {topic_name} are gone, closing");
                                break;
                            }
                        }
                        Err(TcpRosError::Eof) => {
                            debug!("Publisher {publisher_uri} closed the stream for {topic_name}");
                            break;
                        }
                        Err(err) => {
                            warn!("Error reading from publisher {publisher_uri} on {topic_name}: {err}");
                            break;
                        }
                    }
                }
            }
            let _ = stream.shutdown().await;
            // Forget the publisher so a later publisherUpdate can reconnect.
            publisher_list
                .write()
                .await
                .retain(|publisher| *publisher != publisher_uri);
            drop(permit);
        });
        self.subscription_tasks.push(handle.into());
    }
}

/// Resolves and opens one publisher connection: `requestTopic` on the
/// publisher's Slave API, TCP connect, handshake exchange, validation.
async fn establish_publisher_connection(
    topic_name: &str,
    publisher_uri: &str,
    conn_header: ConnectionHeader,
) -> Result<TcpStream, embros_common::Error> {
    let (host, port) = request_topic(publisher_uri, &conn_header.caller_id, topic_name).await?;
    let mut stream = timeout(TCPROS_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| embros_common::Error::Timeout(format!("connecting to {host}:{port}")))??;

    let conn_header_bytes = conn_header.to_bytes(true)?;
    timeout(TCPROS_TIMEOUT, stream.write_all(&conn_header_bytes[..]))
        .await
        .map_err(|_| embros_common::Error::Timeout("sending the handshake".to_owned()))??;

    let responded_header = timeout(TCPROS_TIMEOUT, tcpros::receive_header(&mut stream, true))
        .await
        .map_err(|_| embros_common::Error::Timeout("awaiting the handshake".to_owned()))?
        .map_err(embros_common::Error::from)?;

    // Validating a response is exact; the wildcard allowance only exists on
    // the server side of service handshakes.
    if responded_header.md5sum != conn_header.md5sum {
        error!(
            "Tried to subscribe to {}, but md5sums do not match. Expected {:?}, received {:?}",
            topic_name, conn_header.md5sum, responded_header.md5sum
        );
        return Err(embros_common::Error::SerializationError(format!(
            "md5sums do not match on {}",
            topic_name
        )));
    }
    debug!("Established connection with publisher for {topic_name}");
    Ok(stream)
}

/// Asks a publisher's Slave API for its TCPROS endpoint.
pub(crate) async fn request_topic(
    publisher_uri: &str,
    caller_id: &str,
    topic_name: &str,
) -> Result<(String, u16), XmlRpcError> {
    let protocols = XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::string(
        "TCPROS",
    )])]);
    let (status, _msg, payload) = xmlrpc::call_method(
        publisher_uri,
        "requestTopic",
        &[
            XmlRpcValue::string(caller_id),
            XmlRpcValue::string(topic_name),
            protocols,
        ],
    )
    .await?;
    if status != code::SUCCESS {
        return Err(XmlRpcError::BadConn(format!(
            "requestTopic for {:?} failed with code {}",
            topic_name, status
        )));
    }
    let mut triple = payload.into_array()?;
    if triple.len() != 3 {
        return Err(XmlRpcError::BadConn(
            "requestTopic did not return [protocol, host, port]".to_owned(),
        ));
    }
    let port = triple.pop().expect("len checked").as_int()?;
    let host = triple.pop().expect("len checked").into_string()?;
    let protocol = triple.pop().expect("len checked").into_string()?;
    if protocol != "TCPROS" {
        return Err(XmlRpcError::BadConn(format!(
            "got unsupported protocol {:?}",
            protocol
        )));
    }
    let port = u16::try_from(port)
        .map_err(|_| XmlRpcError::BadConn(format!("implausible TCPROS port {}", port)))?;
    debug!("Got a TCPROS publisher endpoint at {host}:{port}");
    Ok((host, port))
}
