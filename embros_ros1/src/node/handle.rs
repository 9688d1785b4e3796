use super::actor::{NodeServer, NodeServerHandle};
use super::{tcpros_server, xmlrpc_server, NodeState, SLAVE_POOL_SIZE, TCPROS_SERVER_POOL_SIZE};
use crate::config::NodeConfig;
use crate::master::{MasterClient, SystemState};
use crate::names::Name;
use crate::pool::WorkerPool;
use crate::publisher::{Publisher, PublisherAny};
use crate::registry;
use crate::service_client::ServiceClient;
use crate::service_server::{ServiceCallback, ServiceServer};
use crate::subscriber::{Subscriber, SubscriberAny};
use crate::xmlrpc::XmlRpcValue;
use abort_on_drop::ChildTask;
use embros_common::{Error, Result, RosMessageType, RosServiceType, ServiceFn, ShapeShifter};
use log::*;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// The handle to a running node.
///
/// Cheap to clone; the node itself (actor, Slave XMLRPC server, TCPROS
/// listener) lives in background tasks owned by the last surviving clone.
/// Dropping every handle tears the node down.
#[derive(Clone)]
pub struct NodeHandle {
    inner: NodeServerHandle,
    node_name: Name,
    master: MasterClient,
    xmlrpc_uri: String,
    tcpros_uri: String,
    shutdown_rx: watch::Receiver<Option<String>>,
    _tasks: Arc<NodeTasks>,
}

struct NodeTasks {
    _node: ChildTask<()>,
    _xmlrpc: ChildTask<()>,
    _tcpros: ChildTask<()>,
}

impl NodeHandle {
    /// Creates a node with a default configuration: ephemeral listener
    /// ports, advertised URIs derived from the local hostname.
    ///
    /// Creation succeeds even when the Master is currently unreachable; the
    /// node keeps polling and registers as soon as it appears.
    pub async fn new(master_uri: &str, name: &str) -> Result<NodeHandle> {
        Self::with_config(NodeConfig::new(master_uri, name)?).await
    }

    /// Creates a node from an explicit (possibly persisted) configuration.
    pub async fn with_config(mut config: NodeConfig) -> Result<NodeHandle> {
        let xmlrpc_listener = TcpListener::bind(config.xmlrpc_addr).await?;
        let tcpros_listener = TcpListener::bind(config.tcpros_addr).await?;
        config.xmlrpc_addr = xmlrpc_listener.local_addr()?;
        config.tcpros_addr = tcpros_listener.local_addr()?;
        config.set_advertised_ports(config.xmlrpc_addr.port(), config.tcpros_addr.port());
        info!(
            "Node {} serving XMLRPC on {} and TCPROS on {}",
            config.node_name, config.xmlrpc_uri, config.tcpros_uri
        );

        let master = MasterClient::new(
            &config.master_uri,
            config.node_name.as_str(),
            &config.xmlrpc_uri,
        )
        .map_err(Error::from)?
        .fixed_content_length(config.fixed_content_length);

        let (node_exit_tx, node_exit_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let (server, handle) = NodeServer::new(&config, master.clone(), node_exit_tx, shutdown_tx);

        let xmlrpc_task = tokio::spawn(xmlrpc_server::run(
            xmlrpc_listener,
            handle.clone(),
            WorkerPool::new("slave", SLAVE_POOL_SIZE),
            node_exit_rx.clone(),
            config.fixed_content_length,
        ));
        let tcpros_task = tokio::spawn(tcpros_server::run(
            tcpros_listener,
            handle.clone(),
            WorkerPool::new("tcpros-server", TCPROS_SERVER_POOL_SIZE),
            node_exit_rx,
        ));
        let node_task = tokio::spawn(server.run());

        Ok(NodeHandle {
            inner: handle,
            node_name: config.node_name.clone(),
            master,
            xmlrpc_uri: config.xmlrpc_uri.clone(),
            tcpros_uri: config.tcpros_uri.clone(),
            shutdown_rx,
            _tasks: Arc::new(NodeTasks {
                _node: node_task.into(),
                _xmlrpc: xmlrpc_task.into(),
                _tcpros: tcpros_task.into(),
            }),
        })
    }

    pub fn node_name(&self) -> &Name {
        &self.node_name
    }

    /// The advertised Slave API URI of this node.
    pub fn xmlrpc_uri(&self) -> &str {
        &self.xmlrpc_uri
    }

    /// The advertised TCPROS endpoint of this node.
    pub fn tcpros_uri(&self) -> &str {
        &self.tcpros_uri
    }

    pub async fn state(&self) -> Result<NodeState> {
        self.inner.get_state().await
    }

    fn resolve(&self, name: &str) -> Result<Name> {
        Ok(Name::new(name)?.resolve(&self.node_name))
    }

    /// Advertises a topic and returns a typed publisher for it.
    pub async fn advertise<T: RosMessageType>(
        &self,
        topic_name: &str,
        queue_size: usize,
        latching: bool,
    ) -> Result<Publisher<T>> {
        let topic = self.resolve(topic_name)?;
        let sender = self
            .inner
            .register_publisher(
                topic.as_str(),
                T::ROS_TYPE_NAME,
                T::MD5SUM,
                T::DEFINITION,
                latching,
                queue_size,
            )
            .await?;
        Ok(Publisher::new(topic.as_str(), sender))
    }

    /// Advertises a topic whose type is only known at runtime. The type must
    /// have been registered with [`crate::registry`] first.
    pub async fn advertise_any(
        &self,
        topic_name: &str,
        topic_type: &str,
        queue_size: usize,
        latching: bool,
    ) -> Result<PublisherAny> {
        let info = registry::lookup_message_type(topic_type).ok_or_else(|| {
            Error::BadParam(format!(
                "unknown message type {:?}; register it first",
                topic_type
            ))
        })?;
        let topic = self.resolve(topic_name)?;
        let sender = self
            .inner
            .register_publisher(
                topic.as_str(),
                &info.name,
                &info.md5sum,
                &info.definition,
                latching,
                queue_size,
            )
            .await?;
        Ok(PublisherAny::new(topic.as_str(), sender))
    }

    /// Subscribes to a topic and returns a typed message stream.
    pub async fn subscribe<T: RosMessageType>(
        &self,
        topic_name: &str,
        queue_size: usize,
    ) -> Result<Subscriber<T>> {
        let topic = self.resolve(topic_name)?;
        let receiver = self
            .inner
            .register_subscriber(topic.as_str(), T::ROS_TYPE_NAME, T::MD5SUM, queue_size)
            .await?;
        Ok(Subscriber::new(receiver))
    }

    /// Subscribes to a topic without knowing its type, yielding raw wire
    /// bytes. The wildcard descriptor goes out in the handshake; whether a
    /// publisher accepts it is up to that publisher's validation rules.
    pub async fn subscribe_any(
        &self,
        topic_name: &str,
        queue_size: usize,
    ) -> Result<SubscriberAny> {
        let topic = self.resolve(topic_name)?;
        let receiver = self
            .inner
            .register_subscriber(
                topic.as_str(),
                ShapeShifter::ROS_TYPE_NAME,
                ShapeShifter::MD5SUM,
                queue_size,
            )
            .await?;
        Ok(SubscriberAny::new(receiver))
    }

    /// Unadvertises a topic. In-flight subscriber streams are closed by the
    /// publication teardown.
    pub async fn unadvertise(&self, topic_name: &str) -> Result<()> {
        let topic = self.resolve(topic_name)?;
        self.inner.unregister_publisher(topic.as_str()).await
    }

    /// Unsubscribes from a topic.
    pub async fn unsubscribe(&self, topic_name: &str) -> Result<()> {
        let topic = self.resolve(topic_name)?;
        self.inner.unregister_subscriber(topic.as_str()).await
    }

    /// Advertises a service. The returned handle unadvertises it on drop.
    pub async fn advertise_service<T, F>(
        &self,
        service_name: &str,
        server: F,
    ) -> Result<ServiceServer>
    where
        T: RosServiceType,
        F: ServiceFn<T>,
    {
        let service = self.resolve(service_name)?;
        let callback: ServiceCallback = Arc::new(
            move |bytes: Vec<u8>| -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
                let request = serde_rosmsg::from_slice::<T::Request>(&bytes)
                    .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.to_string().into() })?;
                let response = server(request)?;
                Ok(serde_rosmsg::to_vec(&response)
                    .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.to_string().into() })?)
            },
        );
        self.inner
            .register_service(service.as_str(), T::ROS_SERVICE_NAME, T::MD5SUM, callback)
            .await?;
        Ok(ServiceServer::new(
            service.as_str().to_owned(),
            self.inner.clone(),
        ))
    }

    /// A client for a remote service. With `persistent` the underlying
    /// connection is kept open across calls.
    pub fn service_client<T: RosServiceType>(
        &self,
        service_name: &str,
        persistent: bool,
    ) -> Result<ServiceClient<T>> {
        let service = self.resolve(service_name)?;
        Ok(ServiceClient::new(
            self.node_name.as_str(),
            service.as_str(),
            persistent,
            self.master.clone(),
        ))
    }

    /// Subscribes to a parameter; updates pushed by the Master arrive on the
    /// returned stream. Only flat values are carried.
    pub async fn subscribe_param(&self, key: &str) -> Result<ParamSubscriber> {
        let key = self.resolve(key)?;
        let (initial, receiver) = self.inner.subscribe_param(key.as_str()).await?;
        Ok(ParamSubscriber {
            key: key.as_str().to_owned(),
            initial,
            receiver,
        })
    }

    pub async fn unsubscribe_param(&self, key: &str) -> Result<()> {
        let key = self.resolve(key)?;
        self.inner.unsubscribe_param(key.as_str()).await
    }

    /// Requests node shutdown with a reason, as the Slave `shutdown` method
    /// does. The node unregisters, cancels its connections and goes idle.
    pub fn shutdown(&self, reason: &str) -> Result<()> {
        self.inner.shutdown(reason.to_owned())
    }

    /// A watch carrying the shutdown reason once the node starts its
    /// shutdown sweep (whether Master-initiated, API-initiated, or caused by
    /// Master loss).
    pub fn shutdown_channel(&self) -> watch::Receiver<Option<String>> {
        self.shutdown_rx.clone()
    }

    // --- Parameter server & graph passthroughs -------------------------

    pub async fn get_param(&self, key: &str) -> Result<XmlRpcValue> {
        Ok(self.master.get_param(key).await?)
    }

    pub async fn set_param(&self, key: &str, value: XmlRpcValue) -> Result<()> {
        Ok(self.master.set_param(key, value).await?)
    }

    pub async fn has_param(&self, key: &str) -> Result<bool> {
        Ok(self.master.has_param(key).await?)
    }

    pub async fn delete_param(&self, key: &str) -> Result<()> {
        Ok(self.master.delete_param(key).await?)
    }

    pub async fn search_param(&self, key: &str) -> Result<String> {
        Ok(self.master.search_param(key).await?)
    }

    pub async fn get_param_names(&self) -> Result<Vec<String>> {
        Ok(self.master.get_param_names().await?)
    }

    pub async fn lookup_node(&self, node_name: &str) -> Result<String> {
        Ok(self.master.lookup_node(node_name).await?)
    }

    pub async fn lookup_service(&self, service_name: &str) -> Result<String> {
        Ok(self.master.lookup_service(service_name).await?)
    }

    pub async fn get_published_topics(&self, subgraph: &str) -> Result<Vec<(String, String)>> {
        Ok(self.master.get_published_topics(subgraph).await?)
    }

    pub async fn get_topic_types(&self) -> Result<Vec<(String, String)>> {
        Ok(self.master.get_topic_types().await?)
    }

    pub async fn get_system_state(&self) -> Result<SystemState> {
        Ok(self.master.get_system_state().await?)
    }

    pub async fn get_master_uri(&self) -> Result<String> {
        Ok(self.master.get_uri().await?)
    }
}

/// A stream of updates for one subscribed parameter.
pub struct ParamSubscriber {
    key: String,
    initial: Option<XmlRpcValue>,
    receiver: mpsc::UnboundedReceiver<XmlRpcValue>,
}

impl ParamSubscriber {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value at subscription time, when the Master was reachable.
    pub fn initial(&self) -> Option<&XmlRpcValue> {
        self.initial.as_ref()
    }

    /// The next pushed update, `None` once the node is gone.
    pub async fn next(&mut self) -> Option<XmlRpcValue> {
        self.receiver.recv().await
    }
}
