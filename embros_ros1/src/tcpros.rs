//! The TCPROS wire codec and connection handshake.
//!
//! Every TCPROS connection opens with a header: a `u32` byte count followed
//! by that many bytes of length-prefixed `key=value` fields, all integers
//! little-endian. After the handshake the stream carries length-prefixed
//! message bodies (topics) or request/status/response records (services).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a handshake header.
const MAX_HEADER_LEN: u32 = 1024 * 1024;
/// Upper bound on a single message body frame.
const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum TcpRosError {
    #[error("operation timed out")]
    Timeout,
    #[error("peer closed the connection mid-message")]
    Eof,
    #[error("bad TCPROS data: {0}")]
    Parse(String),
    #[error("peer reported an error: {0}")]
    Remote(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TcpRosError> for embros_common::Error {
    fn from(value: TcpRosError) -> Self {
        match value {
            TcpRosError::Timeout => embros_common::Error::Timeout("tcpros".to_owned()),
            TcpRosError::Eof => embros_common::Error::EndOfStream,
            TcpRosError::Parse(msg) => embros_common::Error::Protocol(msg),
            TcpRosError::Remote(msg) => embros_common::Error::ServerError(msg),
            TcpRosError::Io(err) => embros_common::Error::IoError(err),
        }
    }
}

/// The TCPROS connection header.
///
/// One struct covers every direction/kind combination; [`ConnectionHeader::to_bytes`]
/// picks the field set the role requires, and unknown fields received from a
/// peer are discarded.
#[derive(Clone, Debug, Default)]
pub struct ConnectionHeader {
    pub caller_id: String,
    pub topic: Option<String>,
    pub service: Option<String>,
    /// The message (or service) type name, e.g. `std_msgs/String`.
    pub topic_type: String,
    pub md5sum: Option<String>,
    pub msg_definition: String,
    /// Service request/response type names, `<type>Request` / `<type>Response`.
    pub request_type: Option<String>,
    pub response_type: Option<String>,
    pub persistent: bool,
    pub latching: bool,
    pub tcp_nodelay: bool,
    /// A capability query: after the handshake no payload is exchanged.
    pub probe: bool,
    /// An error envelope; mutually exclusive with everything above except
    /// `topic_type`/`md5sum`.
    pub error: Option<String>,
}

fn push_field(buffer: &mut Vec<u8>, key: &str, value: &str) -> std::io::Result<()> {
    let record = format!("{}={}", key, value);
    WriteBytesExt::write_u32::<LittleEndian>(buffer, record.len() as u32)?;
    std::io::Write::write_all(buffer, record.as_bytes())?;
    Ok(())
}

fn bool_text(flag: bool) -> &'static str {
    if flag {
        "1"
    } else {
        "0"
    }
}

impl ConnectionHeader {
    /// Serializes the header for the wire. `client` selects the
    /// client-to-server field set; the kind (topic vs service vs error
    /// envelope) follows from which fields are present.
    pub fn to_bytes(&self, client: bool) -> std::io::Result<Vec<u8>> {
        let mut fields = Vec::new();
        if let Some(error) = &self.error {
            // callerid-less error envelope
            push_field(&mut fields, "error", error)?;
            push_field(&mut fields, "type", &self.topic_type)?;
            push_field(&mut fields, "md5sum", self.md5sum.as_deref().unwrap_or("*"))?;
        } else if client {
            push_field(&mut fields, "callerid", &self.caller_id)?;
            if let Some(service) = &self.service {
                push_field(&mut fields, "service", service)?;
                push_field(&mut fields, "md5sum", self.md5sum.as_deref().unwrap_or("*"))?;
                if let Some(request_type) = &self.request_type {
                    push_field(&mut fields, "request_type", request_type)?;
                }
                if let Some(response_type) = &self.response_type {
                    push_field(&mut fields, "response_type", response_type)?;
                }
                push_field(&mut fields, "type", &self.topic_type)?;
                push_field(&mut fields, "persistent", bool_text(self.persistent))?;
            } else {
                let topic = self.topic.as_deref().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "header names no topic")
                })?;
                push_field(&mut fields, "topic", topic)?;
                push_field(&mut fields, "md5sum", self.md5sum.as_deref().unwrap_or("*"))?;
                push_field(&mut fields, "type", &self.topic_type)?;
                if !self.msg_definition.is_empty() {
                    push_field(&mut fields, "message_definition", &self.msg_definition)?;
                }
                push_field(&mut fields, "tcp_nodelay", bool_text(self.tcp_nodelay))?;
            }
            if self.probe {
                push_field(&mut fields, "probe", "1")?;
            }
        } else if self.request_type.is_some() {
            // server -> client, service
            push_field(&mut fields, "callerid", &self.caller_id)?;
            push_field(&mut fields, "md5sum", self.md5sum.as_deref().unwrap_or("*"))?;
            push_field(
                &mut fields,
                "request_type",
                self.request_type.as_deref().unwrap_or(""),
            )?;
            push_field(
                &mut fields,
                "response_type",
                self.response_type.as_deref().unwrap_or(""),
            )?;
            push_field(&mut fields, "type", &self.topic_type)?;
        } else {
            // server -> client, topic
            push_field(&mut fields, "callerid", &self.caller_id)?;
            push_field(&mut fields, "md5sum", self.md5sum.as_deref().unwrap_or("*"))?;
            push_field(&mut fields, "type", &self.topic_type)?;
            if !self.msg_definition.is_empty() {
                push_field(&mut fields, "message_definition", &self.msg_definition)?;
            }
            push_field(&mut fields, "latching", bool_text(self.latching))?;
        }

        let mut wire = Vec::with_capacity(fields.len() + 4);
        WriteBytesExt::write_u32::<LittleEndian>(&mut wire, fields.len() as u32)?;
        std::io::Write::write_all(&mut wire, &fields)?;
        Ok(wire)
    }

    /// Parses a header received from a peer. `from_server` is true when the
    /// local side initiated the connection: the direction-specific flags
    /// (`latching` from servers, `persistent`/`tcp_nodelay`/`probe` from
    /// clients) are only accepted from the side that may emit them.
    pub fn from_bytes(bytes: &[u8], from_server: bool) -> Result<Self, TcpRosError> {
        let mut header = ConnectionHeader::default();
        let mut cursor = std::io::Cursor::new(bytes);
        while (cursor.position() as usize) < bytes.len() {
            let field_len = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
                .map_err(|_| TcpRosError::Parse("truncated field length".to_owned()))? as usize;
            let start = cursor.position() as usize;
            let end = start + field_len;
            if field_len == 0 || end > bytes.len() {
                return Err(TcpRosError::Parse("truncated header field".to_owned()));
            }
            let record = std::str::from_utf8(&bytes[start..end])
                .map_err(|_| TcpRosError::Parse("header field is not UTF-8".to_owned()))?;
            cursor.set_position(end as u64);

            let (key, value) = record
                .split_once('=')
                .ok_or_else(|| TcpRosError::Parse(format!("field without '=': {:?}", record)))?;
            match key {
                "callerid" => header.caller_id = value.to_owned(),
                "topic" => header.topic = Some(value.to_owned()),
                "service" => header.service = Some(value.to_owned()),
                "type" => header.topic_type = value.to_owned(),
                "md5sum" => header.md5sum = Some(value.to_owned()),
                "message_definition" => header.msg_definition = value.to_owned(),
                "request_type" => header.request_type = Some(value.to_owned()),
                "response_type" => header.response_type = Some(value.to_owned()),
                "error" => header.error = Some(value.to_owned()),
                "persistent" if !from_server => header.persistent = parse_flag(key, value)?,
                "latching" if from_server => header.latching = parse_flag(key, value)?,
                "tcp_nodelay" if !from_server => header.tcp_nodelay = parse_flag(key, value)?,
                "probe" if !from_server => header.probe = parse_flag(key, value)?,
                "persistent" | "latching" | "tcp_nodelay" | "probe" => {
                    return Err(TcpRosError::Parse(format!(
                        "{} is not valid in this direction",
                        key
                    )));
                }
                unknown => {
                    // Unnecessary fields are consumed and discarded.
                    trace!("ignoring handshake field {:?}", unknown);
                }
            }
        }
        Ok(header)
    }

    /// Builds the callerid-less error envelope answering a handshake that
    /// could not be bound.
    pub fn error_reply(message: impl Into<String>, topic_type: &str, md5sum: &str) -> Self {
        ConnectionHeader {
            error: Some(message.into()),
            topic_type: topic_type.to_owned(),
            md5sum: Some(md5sum.to_owned()),
            ..Default::default()
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, TcpRosError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(TcpRosError::Parse(format!(
            "bad boolean {:?} for {}",
            other, key
        ))),
    }
}

/// Reads the length-prefixed handshake off a stream.
pub async fn receive_header<R: AsyncRead + Unpin>(
    stream: &mut R,
    from_server: bool,
) -> Result<ConnectionHeader, TcpRosError> {
    let header_len = read_le_u32(stream).await?;
    if header_len == 0 || header_len > MAX_HEADER_LEN {
        return Err(TcpRosError::Parse(format!(
            "implausible header length {}",
            header_len
        )));
    }
    let mut bytes = vec![0u8; header_len as usize];
    read_exact_or_eof(stream, &mut bytes).await?;
    let header = ConnectionHeader::from_bytes(&bytes, from_server)?;
    if from_server {
        if let Some(error) = &header.error {
            return Err(TcpRosError::Remote(error.clone()));
        }
    }
    Ok(header)
}

/// Writes a handshake header to a stream.
pub async fn send_header<W: AsyncWrite + Unpin>(
    stream: &mut W,
    header: &ConnectionHeader,
    client: bool,
) -> Result<(), TcpRosError> {
    let bytes = header.to_bytes(client)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed record (a topic message body or a service
/// request/response body).
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, TcpRosError> {
    let body_len = read_le_u32(stream).await?;
    if body_len > MAX_BODY_LEN {
        return Err(TcpRosError::Parse(format!(
            "implausible body length {}",
            body_len
        )));
    }
    let mut body = vec![0u8; body_len as usize];
    read_exact_or_eof(stream, &mut body).await?;
    Ok(body)
}

/// Reads one length-prefixed record and returns it with its length prefix
/// still attached, i.e. in the exact wire form `serde_rosmsg` produces and
/// consumes.
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, TcpRosError> {
    let body_len = read_le_u32(stream).await?;
    if body_len > MAX_BODY_LEN {
        return Err(TcpRosError::Parse(format!(
            "implausible body length {}",
            body_len
        )));
    }
    let mut message = vec![0u8; body_len as usize + 4];
    message[..4].copy_from_slice(&body_len.to_le_bytes());
    read_exact_or_eof(stream, &mut message[4..]).await?;
    Ok(message)
}

/// Writes one length-prefixed record.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    body: &[u8],
) -> Result<(), TcpRosError> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    WriteBytesExt::write_u32::<LittleEndian>(&mut frame, body.len() as u32)?;
    std::io::Write::write_all(&mut frame, body)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_le_u32<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u32, TcpRosError> {
    let mut bytes = [0u8; 4];
    read_exact_or_eof(stream, &mut bytes).await?;
    Ok(u32::from_le_bytes(bytes))
}

async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    stream: &mut R,
    out: &mut [u8],
) -> Result<(), TcpRosError> {
    stream.read_exact(out).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TcpRosError::Eof
        } else {
            TcpRosError::Io(err)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const CHATTER_MD5: &str = "992ce8a1687cec8c8bd883ec73ca41d1";

    fn subscriber_header() -> ConnectionHeader {
        ConnectionHeader {
            caller_id: "/pub".to_owned(),
            topic: Some("/chatter".to_owned()),
            topic_type: "std_msgs/String".to_owned(),
            md5sum: Some(CHATTER_MD5.to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn client_topic_header_round_trips() {
        let mut header = subscriber_header();
        header.tcp_nodelay = true;
        let bytes = header.to_bytes(true).unwrap();
        let parsed = ConnectionHeader::from_bytes(&bytes[4..], false).unwrap();
        assert_eq!(parsed.caller_id, "/pub");
        assert_eq!(parsed.topic.as_deref(), Some("/chatter"));
        assert_eq!(parsed.topic_type, "std_msgs/String");
        assert_eq!(parsed.md5sum.as_deref(), Some(CHATTER_MD5));
        assert!(parsed.tcp_nodelay);
        assert!(!parsed.probe);
    }

    #[test]
    fn client_service_header_round_trips() {
        let header = ConnectionHeader {
            caller_id: "/cli".to_owned(),
            service: Some("/add_two_ints".to_owned()),
            topic_type: "rospy_tutorials/AddTwoInts".to_owned(),
            md5sum: Some("6a2e34150c00229791cc89ff309fff21".to_owned()),
            request_type: Some("rospy_tutorials/AddTwoIntsRequest".to_owned()),
            response_type: Some("rospy_tutorials/AddTwoIntsResponse".to_owned()),
            persistent: true,
            ..Default::default()
        };
        let bytes = header.to_bytes(true).unwrap();
        let parsed = ConnectionHeader::from_bytes(&bytes[4..], false).unwrap();
        assert_eq!(parsed.service.as_deref(), Some("/add_two_ints"));
        assert!(parsed.persistent);
        assert_eq!(
            parsed.request_type.as_deref(),
            Some("rospy_tutorials/AddTwoIntsRequest")
        );
    }

    #[test]
    fn server_topic_header_carries_latching() {
        let header = ConnectionHeader {
            caller_id: "/me".to_owned(),
            topic_type: "std_msgs/String".to_owned(),
            md5sum: Some(CHATTER_MD5.to_owned()),
            latching: true,
            ..Default::default()
        };
        let bytes = header.to_bytes(false).unwrap();
        let parsed = ConnectionHeader::from_bytes(&bytes[4..], true).unwrap();
        assert!(parsed.latching);
        assert!(parsed.topic.is_none());
    }

    #[test]
    fn direction_flags_are_rejected_from_the_wrong_side() {
        // latching from a client is a parse error
        let mut bytes = Vec::new();
        push_field(&mut bytes, "callerid", "/x").unwrap();
        push_field(&mut bytes, "latching", "1").unwrap();
        assert!(matches!(
            ConnectionHeader::from_bytes(&bytes, false),
            Err(TcpRosError::Parse(_))
        ));
        // persistent from a server likewise
        let mut bytes = Vec::new();
        push_field(&mut bytes, "callerid", "/x").unwrap();
        push_field(&mut bytes, "persistent", "1").unwrap();
        assert!(matches!(
            ConnectionHeader::from_bytes(&bytes, true),
            Err(TcpRosError::Parse(_))
        ));
    }

    #[test]
    fn unknown_fields_are_discarded() {
        let mut bytes = Vec::new();
        push_field(&mut bytes, "callerid", "/x").unwrap();
        push_field(&mut bytes, "futuristic_field", "whatever").unwrap();
        push_field(&mut bytes, "type", "std_msgs/Empty").unwrap();
        let parsed = ConnectionHeader::from_bytes(&bytes, false).unwrap();
        assert_eq!(parsed.caller_id, "/x");
        assert_eq!(parsed.topic_type, "std_msgs/Empty");
    }

    #[test]
    fn malformed_booleans_and_fields_are_parse_errors() {
        let mut bytes = Vec::new();
        push_field(&mut bytes, "tcp_nodelay", "yes").unwrap();
        assert!(matches!(
            ConnectionHeader::from_bytes(&bytes, false),
            Err(TcpRosError::Parse(_))
        ));
        // A field without '=' at all:
        let mut raw = Vec::new();
        WriteBytesExt::write_u32::<LittleEndian>(&mut raw, 7).unwrap();
        raw.extend_from_slice(b"onlykey");
        assert!(matches!(
            ConnectionHeader::from_bytes(&raw, false),
            Err(TcpRosError::Parse(_))
        ));
    }

    #[test]
    fn error_reply_is_callerid_less() {
        let reply = ConnectionHeader::error_reply("md5sums do not match", "std_msgs/String", "*");
        let bytes = reply.to_bytes(false).unwrap();
        let parsed = ConnectionHeader::from_bytes(&bytes[4..], true).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("md5sums do not match"));
        assert!(parsed.caller_id.is_empty());
    }

    #[tokio::test]
    async fn receive_header_surfaces_remote_errors() {
        let reply = ConnectionHeader::error_reply("no such topic", "std_msgs/String", "*");
        let wire = reply.to_bytes(false).unwrap();
        let mut stream: &[u8] = Box::leak(wire.into_boxed_slice());
        let result = receive_header(&mut stream, true).await;
        assert!(matches!(result, Err(TcpRosError::Remote(_))));
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"payload bytes").await.unwrap();
        let mut stream: &[u8] = Box::leak(wire.into_boxed_slice());
        assert_eq!(read_frame(&mut stream).await.unwrap(), b"payload bytes");
    }

    #[tokio::test]
    async fn truncated_frame_is_eof() {
        let mut wire = Vec::new();
        WriteBytesExt::write_u32::<LittleEndian>(&mut wire, 100).unwrap();
        wire.extend_from_slice(b"short");
        let mut stream: &[u8] = Box::leak(wire.into_boxed_slice());
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(TcpRosError::Eof)
        ));
    }
}
