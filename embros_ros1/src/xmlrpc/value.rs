use super::XmlRpcError;

/// A typed XMLRPC parameter value.
///
/// Only the flat subset the ROS APIs actually exchange is represented.
/// `<base64>` payloads decode to an empty string and `<struct>` members are
/// skipped wholesale; both are tracked by [`XmlRpcValue::Struct`] /
/// [`XmlRpcValue::String`] so a response containing them still parses.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlRpcValue {
    Int(i32),
    Bool(bool),
    String(String),
    Double(f64),
    Array(Vec<XmlRpcValue>),
    /// A `<struct>` whose members were skipped on receive (flat values only).
    Struct,
}

impl XmlRpcValue {
    pub fn string(value: impl Into<String>) -> Self {
        XmlRpcValue::String(value.into())
    }

    /// Class name used in diagnostics when a response has the wrong shape.
    pub fn class_name(&self) -> &'static str {
        match self {
            XmlRpcValue::Int(_) => "int",
            XmlRpcValue::Bool(_) => "boolean",
            XmlRpcValue::String(_) => "string",
            XmlRpcValue::Double(_) => "double",
            XmlRpcValue::Array(_) => "array",
            XmlRpcValue::Struct => "struct",
        }
    }

    pub fn as_int(&self) -> Result<i32, XmlRpcError> {
        match self {
            XmlRpcValue::Int(value) => Ok(*value),
            other => Err(other.wrong_class("int")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, XmlRpcError> {
        match self {
            XmlRpcValue::Bool(value) => Ok(*value),
            other => Err(other.wrong_class("boolean")),
        }
    }

    pub fn as_str(&self) -> Result<&str, XmlRpcError> {
        match self {
            XmlRpcValue::String(value) => Ok(value),
            other => Err(other.wrong_class("string")),
        }
    }

    pub fn into_string(self) -> Result<String, XmlRpcError> {
        match self {
            XmlRpcValue::String(value) => Ok(value),
            other => Err(other.wrong_class("string")),
        }
    }

    pub fn as_array(&self) -> Result<&[XmlRpcValue], XmlRpcError> {
        match self {
            XmlRpcValue::Array(values) => Ok(values),
            other => Err(other.wrong_class("array")),
        }
    }

    pub fn into_array(self) -> Result<Vec<XmlRpcValue>, XmlRpcError> {
        match self {
            XmlRpcValue::Array(values) => Ok(values),
            other => Err(other.wrong_class("array")),
        }
    }

    fn wrong_class(&self, wanted: &str) -> XmlRpcError {
        XmlRpcError::BadConn(format!(
            "expected a {} value, got a {}",
            wanted,
            self.class_name()
        ))
    }
}

impl From<i32> for XmlRpcValue {
    fn from(value: i32) -> Self {
        XmlRpcValue::Int(value)
    }
}

impl From<bool> for XmlRpcValue {
    fn from(value: bool) -> Self {
        XmlRpcValue::Bool(value)
    }
}

impl From<&str> for XmlRpcValue {
    fn from(value: &str) -> Self {
        XmlRpcValue::String(value.to_owned())
    }
}

impl From<String> for XmlRpcValue {
    fn from(value: String) -> Self {
        XmlRpcValue::String(value)
    }
}

impl From<f64> for XmlRpcValue {
    fn from(value: f64) -> Self {
        XmlRpcValue::Double(value)
    }
}

impl From<Vec<XmlRpcValue>> for XmlRpcValue {
    fn from(values: Vec<XmlRpcValue>) -> Self {
        XmlRpcValue::Array(values)
    }
}
