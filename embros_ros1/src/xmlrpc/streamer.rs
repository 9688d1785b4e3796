use super::{XmlRpcError, XmlRpcValue};
use log::*;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// On-wire body length of every message emitted in fixed-length mode, and
/// the upper bound on any message the node emits in that mode.
///
/// Older rosmaster implementations check `Content-Length` before parsing, so
/// a streaming encoder that cannot know the length in advance declares this
/// constant and pads the body out to it with trailing LFs, which the
/// reference implementation tolerates as whitespace.
pub const FIXED_BODY_LEN: usize = 4000;

/// Canonical reason phrases for the status codes the node emits or expects.
fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A buffered XMLRPC message writer.
///
/// The XML body accumulates in memory; [`XmlRpcStreamer::send_request`] /
/// [`XmlRpcStreamer::send_response`] emit the HTTP framing with an exact
/// `Content-Length` by default, or the [`FIXED_BODY_LEN`] interop form when
/// [`XmlRpcStreamer::fixed_content_length`] is set.
pub struct XmlRpcStreamer<W> {
    writer: W,
    body: Vec<u8>,
    string_tag: bool,
    fixed_length: bool,
}

impl<W: AsyncWrite + Unpin> XmlRpcStreamer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            body: Vec::with_capacity(512),
            string_tag: false,
            fixed_length: false,
        }
    }

    /// Wrap emitted strings in `<string>` tags instead of bare text.
    pub fn string_tag(mut self, on: bool) -> Self {
        self.string_tag = on;
        self
    }

    /// Emit the legacy fixed-width `Content-Length` form.
    pub fn fixed_content_length(mut self, on: bool) -> Self {
        self.fixed_length = on;
        self
    }

    /// Appends raw bytes to the message body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Decimal, no leading zeros.
    pub fn uint32(&mut self, value: u32) {
        self.write(value.to_string().as_bytes());
    }

    /// Decimal, sign only on negatives.
    pub fn int32(&mut self, value: i32) {
        self.write(value.to_string().as_bytes());
    }

    pub fn double(&mut self, value: f64) {
        // Canonical formatting; "1" would parse back as an int-formed
        // double, which the simplified reader accepts.
        let text = format!("{}", value);
        self.write(text.as_bytes());
    }

    /// Serializes one `<value>…</value>`.
    pub fn value(&mut self, value: &XmlRpcValue) {
        self.write(b"<value>");
        match value {
            XmlRpcValue::Int(number) => {
                self.write(b"<int>");
                self.int32(*number);
                self.write(b"</int>");
            }
            XmlRpcValue::Bool(flag) => {
                self.write(b"<boolean>");
                self.write(if *flag { b"1" } else { b"0" });
                self.write(b"</boolean>");
            }
            XmlRpcValue::String(text) => {
                if self.string_tag {
                    self.write(b"<string>");
                    self.write(text.as_bytes());
                    self.write(b"</string>");
                } else {
                    self.write(text.as_bytes());
                }
            }
            XmlRpcValue::Double(number) => {
                self.write(b"<double>");
                self.double(*number);
                self.write(b"</double>");
            }
            XmlRpcValue::Array(values) => {
                self.write(b"<array><data>");
                for element in values {
                    self.value(element);
                }
                self.write(b"</data></array>");
            }
            XmlRpcValue::Struct => {
                warn!("emitting an empty <struct> value (not supported)");
                self.write(b"<struct></struct>");
            }
        }
        self.write(b"</value>");
    }

    /// Builds a complete `methodCall` body.
    pub fn method_call(&mut self, method: &str, params: &[XmlRpcValue]) {
        self.write(b"<?xml version=\"1.0\"?>");
        self.write(b"<methodCall><methodName>");
        self.write(method.as_bytes());
        self.write(b"</methodName><params>");
        for param in params {
            self.write(b"<param>");
            self.value(param);
            self.write(b"</param>");
        }
        self.write(b"</params></methodCall>");
    }

    /// Builds a complete `methodResponse` body carrying the standard
    /// `[code, statusMessage, payload]` triple.
    pub fn method_response(&mut self, code: i32, status: &str, payload: &XmlRpcValue) {
        self.write(b"<?xml version=\"1.0\"?>");
        self.write(b"<methodResponse><params><param><value><array><data>");
        self.value(&XmlRpcValue::Int(code));
        self.value(&XmlRpcValue::String(status.to_owned()));
        self.value(payload);
        self.write(b"</data></array></value></param></params></methodResponse>");
    }

    /// Emits `POST /RPC2` framing plus the buffered body and flushes.
    pub async fn send_request(&mut self, host: &str) -> Result<(), XmlRpcError> {
        let head = format!(
            "POST /RPC2 HTTP/1.0\r\nHost: {}\r\nUser-Agent: embros\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
            host,
            self.declared_length()?
        );
        self.send(head).await
    }

    /// Emits an HTTP status line plus the buffered body and flushes.
    pub async fn send_response(&mut self, code: u16) -> Result<(), XmlRpcError> {
        let head = format!(
            "HTTP/1.0 {} {}\r\nServer: embros\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
            code,
            reason_phrase(code),
            self.declared_length()?
        );
        self.send(head).await
    }

    fn declared_length(&self) -> Result<usize, XmlRpcError> {
        if !self.fixed_length {
            return Ok(self.body.len());
        }
        if self.body.len() > FIXED_BODY_LEN {
            return Err(XmlRpcError::Parse(format!(
                "message body ({} bytes) exceeds the fixed length",
                self.body.len()
            )));
        }
        Ok(FIXED_BODY_LEN)
    }

    async fn send(&mut self, head: String) -> Result<(), XmlRpcError> {
        if self.fixed_length {
            // Trailing LFs are whitespace to the peer's XML parser; they pad
            // the body out to exactly the declared fixed length.
            self.body.resize(FIXED_BODY_LEN, b'\n');
        }
        self.writer.write_all(head.as_bytes()).await?;
        self.writer.write_all(&self.body).await?;
        self.writer.flush().await?;
        self.body.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::XmlRpcParser;
    use super::*;

    fn body_of(streamer: &XmlRpcStreamer<Vec<u8>>) -> &[u8] {
        &streamer.body
    }

    #[tokio::test]
    async fn int_value_bytes_are_exact() {
        let mut streamer = XmlRpcStreamer::new(Vec::new());
        streamer.value(&XmlRpcValue::Int(42));
        assert_eq!(body_of(&streamer), b"<value><int>42</int></value>");
    }

    #[tokio::test]
    async fn string_without_tag_is_bare_text() {
        let mut streamer = XmlRpcStreamer::new(Vec::new());
        streamer.value(&XmlRpcValue::String("hello".to_owned()));
        assert_eq!(body_of(&streamer), b"<value>hello</value>");
    }

    #[tokio::test]
    async fn string_tag_mode_wraps_strings() {
        let mut streamer = XmlRpcStreamer::new(Vec::new()).string_tag(true);
        streamer.value(&XmlRpcValue::String("hello".to_owned()));
        assert_eq!(body_of(&streamer), b"<value><string>hello</string></value>");
    }

    #[tokio::test]
    async fn fixed_length_mode_pads_every_message_to_the_constant() {
        let mut streamer = XmlRpcStreamer::new(Vec::new()).fixed_content_length(true);
        streamer.method_call("getPid", &[XmlRpcValue::String("/caller".to_owned())]);
        streamer.send_request("localhost:11311").await.unwrap();
        let wire = streamer.writer.clone();
        let text = String::from_utf8(wire).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("Content-Length: {}", FIXED_BODY_LEN)));
        assert_eq!(body.len(), FIXED_BODY_LEN);
        assert!(body.ends_with('\n'));
    }

    #[tokio::test]
    async fn exact_length_mode_matches_the_body() {
        let mut streamer = XmlRpcStreamer::new(Vec::new());
        streamer.method_response(1, "", &XmlRpcValue::Int(0));
        streamer.send_response(200).await.unwrap();
        let text = String::from_utf8(streamer.writer.clone()).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[tokio::test]
    async fn oversized_fixed_body_is_rejected() {
        let mut streamer = XmlRpcStreamer::new(Vec::new()).fixed_content_length(true);
        let huge = "x".repeat(FIXED_BODY_LEN + 1);
        streamer.value(&XmlRpcValue::String(huge));
        assert!(streamer.send_response(200).await.is_err());
    }

    #[tokio::test]
    async fn emitted_request_parses_back() {
        let mut streamer = XmlRpcStreamer::new(Vec::new()).fixed_content_length(true);
        streamer.method_call(
            "registerPublisher",
            &[
                XmlRpcValue::String("/turtlesim".to_owned()),
                XmlRpcValue::String("/chatter".to_owned()),
                XmlRpcValue::String("std_msgs/String".to_owned()),
                XmlRpcValue::String("http://host:11411".to_owned()),
            ],
        );
        streamer.send_request("localhost:11311").await.unwrap();

        let wire: &'static [u8] = Box::leak(streamer.writer.clone().into_boxed_slice());
        let mut parser = XmlRpcParser::new(wire);
        let request = parser.http_request().await.unwrap();
        assert_eq!(request.content_length, FIXED_BODY_LEN);
        let (name, params) = parser.method_call().await.unwrap();
        assert_eq!(name, "registerPublisher");
        assert_eq!(params[3], XmlRpcValue::String("http://host:11411".to_owned()));
        parser.drain_body().await.unwrap();
    }

    #[tokio::test]
    async fn value_round_trips_through_the_parser() {
        let cases = vec![
            XmlRpcValue::Int(i32::MIN),
            XmlRpcValue::Int(i32::MAX),
            XmlRpcValue::Bool(false),
            XmlRpcValue::Bool(true),
            XmlRpcValue::String("ros rocks".to_owned()),
            XmlRpcValue::Double(1.5),
            XmlRpcValue::Array(vec![
                XmlRpcValue::Int(3),
                XmlRpcValue::Array(vec![XmlRpcValue::String("deep".to_owned())]),
            ]),
        ];
        for case in cases {
            let mut streamer = XmlRpcStreamer::new(Vec::new());
            streamer.value(&case);
            let wire: &'static [u8] = Box::leak(streamer.body.clone().into_boxed_slice());
            let mut parser = XmlRpcParser::new(wire);
            assert_eq!(parser.value().await.unwrap(), case);
        }
    }
}
