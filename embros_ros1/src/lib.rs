//! This crate provides a native implementation of a ROS1 client node.
//!
//! A node built on this crate registers itself with a rosmaster, exposes the
//! standard Slave XMLRPC API to its peers, and exchanges topic streams and
//! service calls over TCPROS. Message bodies are (de)serialized through the
//! [`embros_common::RosMessageType`] trait with `serde_rosmsg`, so any type
//! with the right serde implementation can travel over a topic.
//!
//! Quickstart:
//! ```no_run
//! # #[derive(serde::Serialize, serde::Deserialize, Debug, Default, Clone)]
//! # struct StdString { data: String }
//! # impl embros_common::RosMessageType for StdString {
//! #     const ROS_TYPE_NAME: &'static str = "std_msgs/String";
//! #     const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";
//! # }
//! # async fn example() -> embros_common::Result<()> {
//! let nh = embros_ros1::NodeHandle::new("http://localhost:11311", "/my_node").await?;
//! let publisher = nh.advertise::<StdString>("/chatter", 10, false).await?;
//! publisher.publish(&StdString { data: "hello".to_owned() }).await?;
//! # Ok(())
//! # }
//! ```

/// Node configuration: names, advertised addresses, persistence.
pub mod config;
/// Typed wrappers for the rosmaster XMLRPC API.
pub mod master;
/// ROS graph name validation and resolution.
pub mod names;
/// The node itself: actor, lifecycle, Slave server, TCPROS listener.
pub mod node;
/// Worker admission gates bounding concurrent connection handlers.
pub mod pool;
/// Topic publishing endpoints.
pub mod publisher;
/// Global message/service type tables for type-erased endpoints.
pub mod registry;
/// Service call endpoints.
pub mod service_client;
/// Service serving endpoints.
pub mod service_server;
/// Topic subscribing endpoints.
pub mod subscriber;
/// The TCPROS wire codec and connection handshake.
pub mod tcpros;
/// The streaming XMLRPC engine (parser, streamer, call layer).
pub mod xmlrpc;

pub use config::NodeConfig;
pub use node::{NodeHandle, NodeState, ParamSubscriber};
pub use publisher::{Publisher, PublisherAny};
pub use service_client::ServiceClient;
pub use service_server::ServiceServer;
pub use subscriber::{Subscriber, SubscriberAny};

use std::time::Duration;

/// Receive/send bound applied to every XMLRPC socket.
pub(crate) const XMLRPC_TIMEOUT: Duration = Duration::from_secs(5);
/// Receive/send bound applied to every TCPROS socket during the handshake.
pub(crate) const TCPROS_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the node checks that the Master is still alive.
pub(crate) const MASTER_POLL_PERIOD: Duration = Duration::from_secs(3);
/// Short bound on the Master liveness probe so a dead Master is noticed
/// within one poll period.
pub(crate) const MASTER_POLL_TIMEOUT: Duration = Duration::from_secs(2);
