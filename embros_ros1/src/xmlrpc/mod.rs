//! A streaming XMLRPC engine over HTTP/1.x.
//!
//! This module is deliberately self-contained: it implements exactly the
//! subset of XMLRPC that the ROS Master and Slave APIs exchange, including
//! the interoperability quirks of the reference implementation (see
//! [`streamer::XmlRpcStreamer`] for the fixed-width `Content-Length` mode).
//! Values outside that subset (`<base64>`, `<struct>`) are accepted on the
//! wire but their content is skipped.

mod client;
mod parser;
mod streamer;
mod value;

pub use client::{call_method, call_method_at};
pub(crate) use client::call_method_cfg;
pub use parser::{HttpRequest, XmlRpcParser};
pub use streamer::{XmlRpcStreamer, FIXED_BODY_LEN};
pub use value::XmlRpcValue;

/// Errors raised by the XMLRPC engine.
///
/// The parser and streamer surface precise failures; the call layer folds
/// transport failures into [`XmlRpcError::BadConn`] / [`XmlRpcError::NoConn`]
/// so callers can bail with a single `?`.
#[derive(thiserror::Error, Debug)]
pub enum XmlRpcError {
    #[error("operation timed out")]
    Timeout,
    #[error("unexpected end of stream")]
    Eof,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("bad parameter: {0}")]
    BadParam(String),
    #[error("connection not alive")]
    NoConn,
    #[error("peer returned bad data: {0}")]
    BadConn(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<XmlRpcError> for embros_common::Error {
    fn from(value: XmlRpcError) -> Self {
        match value {
            XmlRpcError::Timeout => embros_common::Error::Timeout("xmlrpc".to_owned()),
            XmlRpcError::Eof => embros_common::Error::EndOfStream,
            XmlRpcError::Parse(msg) => embros_common::Error::Protocol(msg),
            XmlRpcError::BadParam(msg) => embros_common::Error::BadParam(msg),
            XmlRpcError::NoConn => embros_common::Error::Disconnected,
            XmlRpcError::BadConn(msg) => embros_common::Error::ServerError(msg),
            XmlRpcError::Io(err) => embros_common::Error::IoError(err),
        }
    }
}

/// XMLRPC response codes used by the ROS APIs.
pub mod code {
    pub const ERROR: i32 = -1;
    pub const FAILURE: i32 = 0;
    pub const SUCCESS: i32 = 1;
}
