//! # embros_common
//! This crate provides the common error type and the message/service traits
//! shared by the embros crates.

/// The central error type used throughout embros.
///
/// Internal modules keep their own more precise error enums and coerce them
/// into this type at the API boundary, so user-facing calls all return the
/// same failure categories.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Is returned when communication with a peer (or the Master) is fully
    /// lost, or when an operation is attempted on a connection that is no
    /// longer alive.
    #[error("No connection to the ROS peer")]
    Disconnected,
    /// A socket operation or a wait exceeded its configured bound.
    #[error("Operation timed out: {0}")]
    Timeout(String),
    /// A protocol syntax violation: malformed HTTP, XML, XMLRPC or a bad
    /// TCPROS handshake header.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The peer closed the stream in the middle of a message.
    #[error("Peer closed the stream mid-message")]
    EndOfStream,
    /// When a message is received but cannot be serialized/deserialized to
    /// the Rust type representing the message type.
    ///
    /// This error is also returned in the event of an md5sum mismatch.
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// The remote returned structurally valid but semantically wrong data:
    /// an HTTP status other than 200, an XMLRPC failure code, or a TCPROS
    /// handshake answered with an `error=` field.
    #[error("ROS peer reported an error: {0}")]
    ServerError(String),
    /// Returned when there is a fundamental networking error.
    ///
    /// Typically reserved for situations when ports are unavailable, dns lookups fail, etc.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// When a topic, service or parameter name doesn't meet ROS requirements.
    #[error("Name does not meet ROS requirements: {0}")]
    InvalidName(String),
    /// A caller-detectable input violation: duplicate registration, unknown
    /// topic, mismatched type, a rejected parameter.
    #[error("Bad parameter: {0}")]
    BadParam(String),
    /// A feature that is deliberately not implemented (base64 and struct
    /// XMLRPC payloads).
    #[error("Feature not implemented: {0}")]
    Unsupported(&'static str),
    /// A worker pool was at capacity and refused a new connection.
    #[error("Worker pool exhausted")]
    WorkerLimit,
    /// Anything that doesn't cleanly fit in the other categories.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Generic result type used throughout embros.
pub type Result<T> = std::result::Result<T, Error>;

/// Fundamental trait for the message types this crate moves around.
///
/// The runtime never looks inside a message body; it only needs the type
/// name, md5sum and full definition for handshakes and registrations, plus
/// serde bounds so the typed endpoints can encode/decode bodies.
pub trait RosMessageType:
    'static + serde::de::DeserializeOwned + Send + serde::Serialize + Sync + Clone + std::fmt::Debug
{
    /// Expected to be the combination pkg_name/type_name string describing the type to ros
    /// Example: std_msgs/Header
    const ROS_TYPE_NAME: &'static str;

    /// The computed md5sum of the message file and its dependencies
    const MD5SUM: &'static str = "";

    /// The full definition from the msg or srv file, including the expanded
    /// definitions of all nested types.
    const DEFINITION: &'static str = "";
}

// This special impl allows for services with no args / returns
impl RosMessageType for () {
    const ROS_TYPE_NAME: &'static str = "";
    const MD5SUM: &'static str = "";
    const DEFINITION: &'static str = "";
}

/// Represents a ROS service type definition corresponding to a `.srv` file.
///
/// Used by service endpoints to name the request/response pair that travels
/// over a single TCPROS service connection.
pub trait RosServiceType: 'static + Send + Sync {
    /// Name of the ros service e.g. `rospy_tutorials/AddTwoInts`
    const ROS_SERVICE_NAME: &'static str;
    /// The computed md5sum of the service file and its dependencies
    const MD5SUM: &'static str;
    /// The type of data being sent in the request
    type Request: RosMessageType;
    /// The type of data expected in the response
    type Response: RosMessageType;
}

/// This trait describes a function which can validly act as a ROS service
/// server with embros. We're really just using this as a trait alias
/// as the full definition is overly verbose and trait aliases are unstable.
pub trait ServiceFn<T: RosServiceType>:
    Fn(
        T::Request,
    ) -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
    + Send
    + Sync
    + 'static
{
}

/// Automatic implementation of ServiceFn for Fn
impl<T, F> ServiceFn<T> for F
where
    T: RosServiceType,
    F: Fn(
            T::Request,
        )
            -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
}

/// A generic message type used to provide a subscriber / publisher without
/// compile-time knowledge of the message type; bodies pass through as raw
/// bytes.
#[derive(::serde::Deserialize, ::serde::Serialize, Debug, Default, Clone, PartialEq)]
pub struct ShapeShifter(Vec<u8>);

// The equivalent of rospy AnyMsg or C++ ShapeShifter, subscribe_any() uses this type
impl RosMessageType for ShapeShifter {
    const ROS_TYPE_NAME: &'static str = "*";
    const MD5SUM: &'static str = "*";
    const DEFINITION: &'static str = "";
}
