//! The node actor: single owner of the live registries and the lifecycle
//! state machine.
//!
//! Everything that mutates node state goes through the actor's mailbox, so
//! registration, inbound connection routing, and the shutdown sweep are
//! serialized without any shared locks. The actor also drives the Master
//! poll: every three seconds it probes `getPid`; on first contact it
//! registers everything it owns, on Master loss it sweeps its connections
//! and goes hunting again.

use super::{InboundConnection, NodeState, TCPROS_CLIENT_POOL_SIZE};
use crate::config::NodeConfig;
use crate::master::MasterClient;
use crate::names::{split_rosrpc_uri, Name};
use crate::pool::WorkerPool;
use crate::publisher::Publication;
use crate::service_server::{ServiceCallback, ServiceServerLink};
use crate::subscriber::Subscription;
use crate::xmlrpc::{XmlRpcError, XmlRpcValue};
use crate::{MASTER_POLL_PERIOD, MASTER_POLL_TIMEOUT};
use embros_common::Error;
use log::*;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;

pub(crate) enum NodeMsg {
    RegisterPublisher {
        topic: String,
        topic_type: String,
        md5sum: String,
        definition: String,
        latching: bool,
        queue_size: usize,
        reply: oneshot::Sender<Result<mpsc::Sender<Vec<u8>>, Error>>,
    },
    UnregisterPublisher {
        topic: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RegisterSubscriber {
        topic: String,
        topic_type: String,
        md5sum: String,
        queue_size: usize,
        reply: oneshot::Sender<Result<broadcast::Receiver<Vec<u8>>, Error>>,
    },
    UnregisterSubscriber {
        topic: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RegisterService {
        service: String,
        service_type: String,
        md5sum: String,
        callback: ServiceCallback,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    UnregisterService {
        service: String,
    },
    SubscribeParam {
        key: String,
        #[allow(clippy::type_complexity)]
        reply: oneshot::Sender<
            Result<(Option<XmlRpcValue>, mpsc::UnboundedReceiver<XmlRpcValue>), Error>,
        >,
    },
    UnsubscribeParam {
        key: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    GetPublications {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    GetSubscriptions {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    GetMasterUri {
        reply: oneshot::Sender<String>,
    },
    GetPid {
        reply: oneshot::Sender<i32>,
    },
    GetState {
        reply: oneshot::Sender<NodeState>,
    },
    RequestTopic {
        topic: String,
        reply: oneshot::Sender<Option<(String, u16)>>,
    },
    PublisherUpdate {
        topic: String,
        publishers: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    ParamUpdate {
        key: String,
        value: XmlRpcValue,
        reply: oneshot::Sender<bool>,
    },
    Inbound {
        connection: InboundConnection,
    },
    Shutdown {
        reason: String,
    },
}

/// Cheap, cloneable mailbox address of the node actor.
#[derive(Clone)]
pub(crate) struct NodeServerHandle {
    sender: mpsc::UnboundedSender<NodeMsg>,
}

impl NodeServerHandle {
    fn send(&self, message: NodeMsg) -> Result<(), Error> {
        self.sender.send(message).map_err(|_| Error::Disconnected)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> NodeMsg,
    ) -> Result<T, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(build(reply_tx))?;
        reply_rx.await.map_err(|_| Error::Disconnected)
    }

    pub(crate) async fn register_publisher(
        &self,
        topic: &str,
        topic_type: &str,
        md5sum: &str,
        definition: &str,
        latching: bool,
        queue_size: usize,
    ) -> Result<mpsc::Sender<Vec<u8>>, Error> {
        self.ask(|reply| NodeMsg::RegisterPublisher {
            topic: topic.to_owned(),
            topic_type: topic_type.to_owned(),
            md5sum: md5sum.to_owned(),
            definition: definition.to_owned(),
            latching,
            queue_size,
            reply,
        })
        .await?
    }

    pub(crate) async fn unregister_publisher(&self, topic: &str) -> Result<(), Error> {
        self.ask(|reply| NodeMsg::UnregisterPublisher {
            topic: topic.to_owned(),
            reply,
        })
        .await?
    }

    pub(crate) async fn register_subscriber(
        &self,
        topic: &str,
        topic_type: &str,
        md5sum: &str,
        queue_size: usize,
    ) -> Result<broadcast::Receiver<Vec<u8>>, Error> {
        self.ask(|reply| NodeMsg::RegisterSubscriber {
            topic: topic.to_owned(),
            topic_type: topic_type.to_owned(),
            md5sum: md5sum.to_owned(),
            queue_size,
            reply,
        })
        .await?
    }

    pub(crate) async fn unregister_subscriber(&self, topic: &str) -> Result<(), Error> {
        self.ask(|reply| NodeMsg::UnregisterSubscriber {
            topic: topic.to_owned(),
            reply,
        })
        .await?
    }

    pub(crate) async fn register_service(
        &self,
        service: &str,
        service_type: &str,
        md5sum: &str,
        callback: ServiceCallback,
    ) -> Result<(), Error> {
        self.ask(|reply| NodeMsg::RegisterService {
            service: service.to_owned(),
            service_type: service_type.to_owned(),
            md5sum: md5sum.to_owned(),
            callback,
            reply,
        })
        .await?
    }

    /// Fire-and-forget so it can run from Drop impls.
    pub(crate) fn unadvertise_service(&self, service: &str) -> Result<(), Error> {
        self.send(NodeMsg::UnregisterService {
            service: service.to_owned(),
        })
    }

    #[allow(clippy::type_complexity)]
    pub(crate) async fn subscribe_param(
        &self,
        key: &str,
    ) -> Result<(Option<XmlRpcValue>, mpsc::UnboundedReceiver<XmlRpcValue>), Error> {
        self.ask(|reply| NodeMsg::SubscribeParam {
            key: key.to_owned(),
            reply,
        })
        .await?
    }

    pub(crate) async fn unsubscribe_param(&self, key: &str) -> Result<(), Error> {
        self.ask(|reply| NodeMsg::UnsubscribeParam {
            key: key.to_owned(),
            reply,
        })
        .await?
    }

    pub(crate) async fn get_publications(&self) -> Result<Vec<(String, String)>, Error> {
        self.ask(|reply| NodeMsg::GetPublications { reply }).await
    }

    pub(crate) async fn get_subscriptions(&self) -> Result<Vec<(String, String)>, Error> {
        self.ask(|reply| NodeMsg::GetSubscriptions { reply }).await
    }

    pub(crate) async fn get_master_uri(&self) -> Result<String, Error> {
        self.ask(|reply| NodeMsg::GetMasterUri { reply }).await
    }

    pub(crate) async fn get_pid(&self) -> Result<i32, Error> {
        self.ask(|reply| NodeMsg::GetPid { reply }).await
    }

    pub(crate) async fn get_state(&self) -> Result<NodeState, Error> {
        self.ask(|reply| NodeMsg::GetState { reply }).await
    }

    pub(crate) async fn request_topic(
        &self,
        topic: String,
    ) -> Result<Option<(String, u16)>, Error> {
        self.ask(|reply| NodeMsg::RequestTopic { topic, reply }).await
    }

    pub(crate) async fn publisher_update(
        &self,
        topic: String,
        publishers: Vec<String>,
    ) -> Result<(), Error> {
        self.ask(|reply| NodeMsg::PublisherUpdate {
            topic,
            publishers,
            reply,
        })
        .await
    }

    pub(crate) async fn param_update(
        &self,
        key: String,
        value: XmlRpcValue,
    ) -> Result<bool, Error> {
        self.ask(|reply| NodeMsg::ParamUpdate { key, value, reply })
            .await
    }

    /// Routes an accepted TCPROS connection to its publication or service.
    pub(crate) fn inbound(&self, connection: InboundConnection) -> Result<(), Error> {
        self.send(NodeMsg::Inbound { connection })
    }

    /// Requests node shutdown; the actor acknowledges nothing, it just goes.
    pub(crate) fn shutdown(&self, reason: String) -> Result<(), Error> {
        self.send(NodeMsg::Shutdown { reason })
    }
}

/// The actor. Owns every live registry and the lifecycle state machine.
pub(crate) struct NodeServer {
    /// Taken by [`NodeServer::run`]; `None` afterwards.
    receiver: Option<mpsc::UnboundedReceiver<NodeMsg>>,
    handle: NodeServerHandle,
    node_name: Name,
    master: MasterClient,
    master_uri: String,
    tcpros_uri: String,
    tcpros_host: String,
    tcpros_port: u16,
    pid: i32,
    state: NodeState,
    exit_flag: bool,
    exit_reason: Option<String>,
    publications: HashMap<String, Publication>,
    subscriptions: HashMap<String, Subscription>,
    services: HashMap<String, ServiceServerLink>,
    param_subs: HashMap<String, mpsc::UnboundedSender<XmlRpcValue>>,
    conn_exit_tx: watch::Sender<bool>,
    conn_exit_rx: watch::Receiver<bool>,
    node_exit_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<Option<String>>,
    client_pool: WorkerPool,
}

impl NodeServer {
    pub(crate) fn new(
        config: &NodeConfig,
        master: MasterClient,
        node_exit_tx: watch::Sender<bool>,
        shutdown_tx: watch::Sender<Option<String>>,
    ) -> (Self, NodeServerHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = NodeServerHandle { sender };
        let (conn_exit_tx, conn_exit_rx) = watch::channel(false);
        let (tcpros_host, tcpros_port) =
            split_rosrpc_uri(&config.tcpros_uri).expect("tcpros URI is derived from a bound port");
        let server = Self {
            receiver: Some(receiver),
            handle: handle.clone(),
            node_name: config.node_name.clone(),
            master,
            master_uri: config.master_uri.clone(),
            tcpros_uri: config.tcpros_uri.clone(),
            tcpros_host,
            tcpros_port,
            pid: std::process::id() as i32,
            state: NodeState::Uninit,
            exit_flag: false,
            exit_reason: None,
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
            services: HashMap::new(),
            param_subs: HashMap::new(),
            conn_exit_tx,
            conn_exit_rx,
            node_exit_tx,
            shutdown_tx,
            client_pool: WorkerPool::new("tcpros-client", TCPROS_CLIENT_POOL_SIZE),
        };
        (server, handle)
    }

    pub(crate) async fn run(mut self) {
        let mut receiver = self.receiver.take().expect("run is called exactly once");
        self.state = NodeState::Startup;
        info!("Node {} starting up", self.node_name);
        let mut poll = tokio::time::interval(MASTER_POLL_PERIOD);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let done = tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => true,
                },
                _ = poll.tick() => self.poll_master().await,
            };
            if done {
                break;
            }
        }
        info!("Node {} is idle", self.node_name);
    }

    /// One state-machine step driven by the periodic Master poll.
    /// Returns true when the node is done for good.
    async fn poll_master(&mut self) -> bool {
        match self.state {
            NodeState::Startup => {
                if self.master_alive().await {
                    info!("Master found at {}", self.master_uri);
                    match self.register_all().await {
                        Ok(()) => self.state = NodeState::Running,
                        Err(err) => {
                            warn!("Registration with the Master failed: {err}; retrying");
                        }
                    }
                }
                false
            }
            NodeState::Running => {
                if self.master_alive().await {
                    return false;
                }
                warn!("Master {} lost", self.master_uri);
                self.shutdown_sweep().await;
                if self.exit_flag {
                    true
                } else {
                    // The node has simply lost sight of the Master: re-arm
                    // the cancellation signal and go hunting again.
                    let _ = self.conn_exit_tx.send(false);
                    self.state = NodeState::Startup;
                    false
                }
            }
            _ => false,
        }
    }

    /// Timeouts here are swallowed on purpose: they are what drives the
    /// state machine.
    async fn master_alive(&self) -> bool {
        matches!(
            timeout(MASTER_POLL_TIMEOUT, self.master.get_pid()).await,
            Ok(Ok(_))
        )
    }

    /// Registers everything the registries hold, in the canonical order:
    /// publications, subscriptions, services, parameter subscriptions.
    async fn register_all(&mut self) -> Result<(), XmlRpcError> {
        for (topic, publication) in &self.publications {
            self.master
                .register_publisher(topic, publication.topic_type())
                .await?;
        }
        let topics: Vec<String> = self.subscriptions.keys().cloned().collect();
        for topic in topics {
            let topic_type = self.subscriptions[&topic].topic_type().to_owned();
            let publishers = self.master.register_subscriber(&topic, &topic_type).await?;
            if let Some(subscription) = self.subscriptions.get_mut(&topic) {
                for uri in publishers {
                    subscription.add_publisher_source(&uri).await;
                }
            }
        }
        for service in self.services.keys().cloned().collect::<Vec<_>>() {
            self.master
                .register_service(&service, &self.tcpros_uri)
                .await?;
        }
        for key in self.param_subs.keys().cloned().collect::<Vec<_>>() {
            let value = self.master.subscribe_param(&key).await?;
            if let Some(sender) = self.param_subs.get(&key) {
                let _ = sender.send(value);
            }
        }
        Ok(())
    }

    /// The RUNNING -> SHUTDOWN sweep: user hook, cooperative cancel of every
    /// live TCPROS connection, then the unregister calls (failures logged
    /// and ignored; local teardown always completes).
    async fn shutdown_sweep(&mut self) {
        self.state = NodeState::Shutdown;
        let reason = self.exit_reason.take().unwrap_or_default();
        info!("Node {} shutting down ({:?})", self.node_name, reason);
        let _ = self.shutdown_tx.send(Some(reason));
        let _ = self.conn_exit_tx.send(true);

        // Unregistration runs in the reverse of the registration order.
        for key in self.param_subs.keys() {
            Self::unregister_step(
                "param subscription",
                key,
                timeout(MASTER_POLL_TIMEOUT, self.master.unsubscribe_param(key)).await,
            );
        }
        for service in self.services.keys() {
            Self::unregister_step(
                "service",
                service,
                timeout(
                    MASTER_POLL_TIMEOUT,
                    self.master.unregister_service(service, &self.tcpros_uri),
                )
                .await,
            );
        }
        for topic in self.subscriptions.keys() {
            Self::unregister_step(
                "subscriber",
                topic,
                timeout(
                    MASTER_POLL_TIMEOUT,
                    self.master.unregister_subscriber(topic),
                )
                .await,
            );
        }
        for topic in self.publications.keys() {
            Self::unregister_step(
                "publisher",
                topic,
                timeout(MASTER_POLL_TIMEOUT, self.master.unregister_publisher(topic)).await,
            );
        }

        if self.exit_flag {
            self.state = NodeState::Idle;
            let _ = self.node_exit_tx.send(true);
            self.publications.clear();
            self.subscriptions.clear();
            self.services.clear();
            self.param_subs.clear();
        }
    }

    fn unregister_step(
        what: &str,
        name: &str,
        result: Result<Result<i32, XmlRpcError>, tokio::time::error::Elapsed>,
    ) {
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("Unregistering {what} {name} failed (ignored): {err}"),
            Err(_) => warn!("Unregistering {what} {name} timed out (ignored)"),
        }
    }

    /// Returns true when the node is done for good.
    async fn handle_message(&mut self, message: NodeMsg) -> bool {
        match message {
            NodeMsg::RegisterPublisher {
                topic,
                topic_type,
                md5sum,
                definition,
                latching,
                queue_size,
                reply,
            } => {
                let result = self
                    .register_publisher(topic, topic_type, md5sum, definition, latching, queue_size)
                    .await;
                let _ = reply.send(result);
            }
            NodeMsg::UnregisterPublisher { topic, reply } => {
                let result = self.unregister_publisher(&topic).await;
                let _ = reply.send(result);
            }
            NodeMsg::RegisterSubscriber {
                topic,
                topic_type,
                md5sum,
                queue_size,
                reply,
            } => {
                let result = self
                    .register_subscriber(topic, topic_type, md5sum, queue_size)
                    .await;
                let _ = reply.send(result);
            }
            NodeMsg::UnregisterSubscriber { topic, reply } => {
                let result = self.unregister_subscriber(&topic).await;
                let _ = reply.send(result);
            }
            NodeMsg::RegisterService {
                service,
                service_type,
                md5sum,
                callback,
                reply,
            } => {
                let result = self
                    .register_service(service, service_type, md5sum, callback)
                    .await;
                let _ = reply.send(result);
            }
            NodeMsg::UnregisterService { service } => {
                self.unregister_service(&service).await;
            }
            NodeMsg::SubscribeParam { key, reply } => {
                let result = self.subscribe_param(key).await;
                let _ = reply.send(result);
            }
            NodeMsg::UnsubscribeParam { key, reply } => {
                let result = self.unsubscribe_param(&key).await;
                let _ = reply.send(result);
            }
            NodeMsg::GetPublications { reply } => {
                let pairs = self
                    .publications
                    .iter()
                    .map(|(name, publication)| (name.clone(), publication.topic_type().to_owned()))
                    .collect();
                let _ = reply.send(pairs);
            }
            NodeMsg::GetSubscriptions { reply } => {
                let pairs = self
                    .subscriptions
                    .iter()
                    .map(|(name, subscription)| {
                        (name.clone(), subscription.topic_type().to_owned())
                    })
                    .collect();
                let _ = reply.send(pairs);
            }
            NodeMsg::GetMasterUri { reply } => {
                let _ = reply.send(self.master_uri.clone());
            }
            NodeMsg::GetPid { reply } => {
                let _ = reply.send(self.pid);
            }
            NodeMsg::GetState { reply } => {
                let _ = reply.send(self.state);
            }
            NodeMsg::RequestTopic { topic, reply } => {
                let endpoint = self
                    .publications
                    .contains_key(&topic)
                    .then(|| (self.tcpros_host.clone(), self.tcpros_port));
                let _ = reply.send(endpoint);
            }
            NodeMsg::PublisherUpdate {
                topic,
                publishers,
                reply,
            } => {
                if let Some(subscription) = self.subscriptions.get_mut(&topic) {
                    // The set difference against already-connected publishers
                    // happens inside the subscription.
                    for uri in publishers {
                        subscription.add_publisher_source(&uri).await;
                    }
                } else {
                    debug!("publisherUpdate for {topic}, which we do not subscribe to");
                }
                let _ = reply.send(());
            }
            NodeMsg::ParamUpdate { key, value, reply } => {
                let delivered = match self.param_subs.get(&key) {
                    Some(sender) => {
                        if sender.send(value).is_ok() {
                            true
                        } else {
                            // Receiver is gone; drop the dead subscription.
                            self.param_subs.remove(&key);
                            false
                        }
                    }
                    None => false,
                };
                let _ = reply.send(delivered);
            }
            NodeMsg::Inbound { connection } => {
                self.route_inbound(connection);
            }
            NodeMsg::Shutdown { reason } => {
                self.exit_flag = true;
                self.exit_reason = Some(reason);
                self.shutdown_sweep().await;
                return true;
            }
        }
        false
    }

    async fn register_publisher(
        &mut self,
        topic: String,
        topic_type: String,
        md5sum: String,
        definition: String,
        latching: bool,
        queue_size: usize,
    ) -> Result<mpsc::Sender<Vec<u8>>, Error> {
        if let Some(existing) = self.publications.get(&topic) {
            if existing.topic_type() != topic_type {
                return Err(Error::BadParam(format!(
                    "topic {} is already advertised as {}",
                    topic,
                    existing.topic_type()
                )));
            }
            if let Some(sender) = existing.get_sender() {
                return Ok(sender);
            }
            // The last Publisher was dropped but cleanup hasn't landed yet.
            self.publications.remove(&topic);
        }
        if self.state == NodeState::Running {
            self.master
                .register_publisher(&topic, &topic_type)
                .await
                .map_err(Error::from)?;
        }
        let (publication, sender) = Publication::new(
            &self.node_name,
            latching,
            &topic,
            queue_size,
            &definition,
            &md5sum,
            &topic_type,
            self.handle.clone(),
            self.conn_exit_rx.clone(),
        );
        self.publications.insert(topic, publication);
        Ok(sender)
    }

    async fn unregister_publisher(&mut self, topic: &str) -> Result<(), Error> {
        if self.publications.remove(topic).is_none() {
            return Err(Error::BadParam(format!("topic {} is not advertised", topic)));
        }
        if self.state == NodeState::Running {
            if let Err(err) = self.master.unregister_publisher(topic).await {
                warn!("Unregistering publisher {topic} failed (ignored): {err}");
            }
        }
        Ok(())
    }

    async fn register_subscriber(
        &mut self,
        topic: String,
        topic_type: String,
        md5sum: String,
        queue_size: usize,
    ) -> Result<broadcast::Receiver<Vec<u8>>, Error> {
        if let Some(existing) = self.subscriptions.get(&topic) {
            if existing.topic_type() != topic_type {
                return Err(Error::BadParam(format!(
                    "topic {} is already subscribed as {}",
                    topic,
                    existing.topic_type()
                )));
            }
            return Ok(existing.get_receiver());
        }
        let mut subscription = Subscription::new(
            &self.node_name,
            &topic,
            &topic_type,
            &md5sum,
            queue_size,
            self.conn_exit_rx.clone(),
            self.client_pool.clone(),
        );
        if self.state == NodeState::Running {
            let publishers = self
                .master
                .register_subscriber(&topic, &topic_type)
                .await
                .map_err(Error::from)?;
            for uri in publishers {
                subscription.add_publisher_source(&uri).await;
            }
        }
        let receiver = subscription.get_receiver();
        self.subscriptions.insert(topic, subscription);
        Ok(receiver)
    }

    async fn unregister_subscriber(&mut self, topic: &str) -> Result<(), Error> {
        if self.subscriptions.remove(topic).is_none() {
            return Err(Error::BadParam(format!("topic {} is not subscribed", topic)));
        }
        if self.state == NodeState::Running {
            if let Err(err) = self.master.unregister_subscriber(topic).await {
                warn!("Unregistering subscriber {topic} failed (ignored): {err}");
            }
        }
        Ok(())
    }

    async fn register_service(
        &mut self,
        service: String,
        service_type: String,
        md5sum: String,
        callback: ServiceCallback,
    ) -> Result<(), Error> {
        if self.services.contains_key(&service) {
            return Err(Error::BadParam(format!(
                "service {} is already advertised",
                service
            )));
        }
        if self.state == NodeState::Running {
            self.master
                .register_service(&service, &self.tcpros_uri)
                .await
                .map_err(Error::from)?;
        }
        let link = ServiceServerLink::new(
            &self.node_name,
            &service,
            &service_type,
            &md5sum,
            callback,
            self.conn_exit_rx.clone(),
        );
        self.services.insert(service, link);
        Ok(())
    }

    async fn unregister_service(&mut self, service: &str) {
        if self.services.remove(service).is_none() {
            return;
        }
        if self.state == NodeState::Running {
            if let Err(err) = self
                .master
                .unregister_service(service, &self.tcpros_uri)
                .await
            {
                warn!("Unregistering service {service} failed (ignored): {err}");
            }
        }
    }

    async fn subscribe_param(
        &mut self,
        key: String,
    ) -> Result<(Option<XmlRpcValue>, mpsc::UnboundedReceiver<XmlRpcValue>), Error> {
        if self.param_subs.contains_key(&key) {
            return Err(Error::BadParam(format!(
                "parameter {} is already subscribed",
                key
            )));
        }
        let initial = if self.state == NodeState::Running {
            Some(
                self.master
                    .subscribe_param(&key)
                    .await
                    .map_err(Error::from)?,
            )
        } else {
            None
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        self.param_subs.insert(key, sender);
        Ok((initial, receiver))
    }

    async fn unsubscribe_param(&mut self, key: &str) -> Result<(), Error> {
        if self.param_subs.remove(key).is_none() {
            return Err(Error::BadParam(format!(
                "parameter {} is not subscribed",
                key
            )));
        }
        if self.state == NodeState::Running {
            if let Err(err) = self.master.unsubscribe_param(key).await {
                warn!("Unsubscribing parameter {key} failed (ignored): {err}");
            }
        }
        Ok(())
    }

    /// Routes an inbound TCPROS connection to the record its handshake
    /// names, or answers with an error header. Lookup happens here, under
    /// the single owner of the registries: a connection can never bind to a
    /// record that has already been unregistered.
    fn route_inbound(&mut self, connection: InboundConnection) {
        if let Some(topic) = connection.header.topic.clone() {
            match self.publications.get(&topic) {
                Some(publication) => publication.bind(connection),
                None => reject_inbound(connection, format!("not a publisher of {topic}")),
            }
        } else if let Some(service) = connection.header.service.clone() {
            match self.services.get(&service) {
                Some(link) => link.bind(connection),
                None => reject_inbound(connection, format!("no provider for service {service}")),
            }
        } else {
            reject_inbound(
                connection,
                "handshake names neither a topic nor a service".to_owned(),
            );
        }
    }
}

fn reject_inbound(connection: InboundConnection, reason: String) {
    tokio::spawn(async move {
        let InboundConnection {
            mut stream, permit, ..
        } = connection;
        debug!("Rejecting an inbound TCPROS connection: {reason}");
        super::tcpros_server::send_error_reply(&mut stream, &reason).await;
        drop(permit);
    });
}
