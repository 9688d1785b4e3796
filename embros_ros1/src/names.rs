use embros_common::Error;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref GRAPH_NAME_RE: Regex =
        Regex::new(r"^([/~]|[/~]?[a-zA-Z][a-zA-Z0-9_]*(/[a-zA-Z][a-zA-Z0-9_]*)*)$").unwrap();
    static ref HTTP_URI_RE: Regex = Regex::new(r"^http://([^:/ ]+):([0-9]+)/?$").unwrap();
    static ref ROSRPC_URI_RE: Regex = Regex::new(r"^rosrpc://([^:/ ]+):([0-9]+)/?$").unwrap();
}

/// A valid ROS graph resource name.
///
/// Construction validates against the ROS naming rules; [`Name::resolve`]
/// turns relative and private names into fully-qualified global ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Name(String);

impl Name {
    pub fn new(name: &str) -> Result<Self, Error> {
        if !GRAPH_NAME_RE.is_match(name) {
            return Err(Error::InvalidName(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn is_global(&self) -> bool {
        self.0.starts_with('/')
    }

    pub fn is_private(&self) -> bool {
        self.0.starts_with('~')
    }

    /// Resolves this name relative to `base` (a node name for private
    /// names, a namespace for relative ones). Global names pass through.
    pub fn resolve(&self, base: &Name) -> Name {
        if self.is_global() {
            return self.clone();
        }
        if self.is_private() {
            return Name(format!("{}/{}", base.0.trim_end_matches('/'), &self.0[1..]));
        }
        let namespace = match base.0.rfind('/') {
            Some(0) | None => "",
            Some(split) => &base.0[..split],
        };
        Name(format!("{}/{}", namespace, self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(formatter)
    }
}

/// Splits `http://host:port[/]` into its host and port.
pub fn split_http_uri(uri: &str) -> Result<(String, u16), Error> {
    split_uri(&HTTP_URI_RE, uri)
}

/// Splits `rosrpc://host:port[/]` (a service API URI) into host and port.
pub fn split_rosrpc_uri(uri: &str) -> Result<(String, u16), Error> {
    split_uri(&ROSRPC_URI_RE, uri)
}

fn split_uri(shape: &Regex, uri: &str) -> Result<(String, u16), Error> {
    let captures = shape
        .captures(uri)
        .ok_or_else(|| Error::Protocol(format!("malformed URI {:?}", uri)))?;
    let host = captures[1].to_owned();
    let port = captures[2]
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("bad port in URI {:?}", uri)))?;
    Ok((host, port))
}
