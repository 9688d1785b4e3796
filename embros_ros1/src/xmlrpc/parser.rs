use super::{XmlRpcError, XmlRpcValue};
use log::*;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// How much is pulled from the transport per refill.
const READ_CHUNK: usize = 4096;
/// Upper bound on any single string captured out of the stream (bare text,
/// `<string>` bodies, header values). Longer runs are a parse error.
pub(crate) const READ_BUFFER_LEN: usize = 16 * 1024;
/// Upper bound on an HTTP header name; longer names are skipped wholesale.
const HEADER_NAME_LEN: usize = 64;

/// The whitespace set shared by the XML and HTTP grammars.
fn is_ws(byte: u8) -> bool {
    matches!(byte, b' ' | b'\r' | b'\n' | b'\t' | 0x0b)
}

/// A parsed HTTP request line + headers, positioned at the body.
#[derive(Debug)]
pub struct HttpRequest {
    pub content_length: usize,
}

/// A pull parser over a refillable byte buffer attached to a connection.
///
/// Every primitive either succeeds, leaving the cursor right after what it
/// consumed, or fails with a precise [`XmlRpcError`]. After the HTTP headers
/// have been parsed, refills never pull past the declared `Content-Length`,
/// so a well-formed message can be followed by another on the same stream.
pub struct XmlRpcParser<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    /// Declared body length, known once the HTTP headers are through.
    content_length: Option<u64>,
    /// Total bytes consumed when the body started.
    mark: u64,
    /// Total bytes consumed so far.
    total: u64,
}

impl<R: AsyncRead + Unpin> XmlRpcParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            content_length: None,
            mark: 0,
            total: 0,
        }
    }

    /// Bytes consumed since the start of the stream.
    pub fn consumed(&self) -> u64 {
        self.total
    }

    /// Bytes of message body consumed so far.
    pub fn body_consumed(&self) -> u64 {
        self.total - self.mark
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Body bytes not yet consumed, `None` before the headers. The declared
    /// length is authoritative: consumption stops there even if the
    /// transport buffered more.
    fn body_remaining(&self) -> Option<u64> {
        self.content_length
            .map(|length| length.saturating_sub(self.body_consumed()))
    }

    /// Body bytes the transport still owes us, `None` before the headers.
    fn body_unfetched(&self) -> Option<u64> {
        self.body_remaining()
            .map(|remaining| remaining.saturating_sub(self.buffered() as u64))
    }

    /// Pulls the next chunk from the transport, never past the declared body
    /// end. Fails with [`XmlRpcError::Eof`] at stream end.
    async fn refill(&mut self) -> Result<(), XmlRpcError> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let want = match self.body_unfetched() {
            Some(0) => return Err(XmlRpcError::Eof),
            Some(n) => READ_CHUNK.min(n as usize),
            None => READ_CHUNK,
        };
        let mut chunk = [0u8; READ_CHUNK];
        let got = self.reader.read(&mut chunk[..want]).await?;
        if got == 0 {
            return Err(XmlRpcError::Eof);
        }
        self.buf.extend_from_slice(&chunk[..got]);
        Ok(())
    }

    /// Makes sure at least `n` bytes are buffered.
    async fn ensure(&mut self, n: usize) -> Result<(), XmlRpcError> {
        if let Some(remaining) = self.body_remaining() {
            if (n as u64) > remaining {
                return Err(XmlRpcError::Eof);
            }
        }
        while self.buffered() < n {
            self.refill().await?;
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.pos += n;
        self.total += n as u64;
    }

    async fn peek(&mut self) -> Result<u8, XmlRpcError> {
        self.ensure(1).await?;
        Ok(self.buf[self.pos])
    }

    async fn next_byte(&mut self) -> Result<u8, XmlRpcError> {
        let byte = self.peek().await?;
        self.consume(1);
        Ok(byte)
    }

    /// Copies `n` bytes into `out`, refilling as needed.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<(), XmlRpcError> {
        let mut done = 0;
        while done < out.len() {
            if self.buffered() == 0 {
                self.refill().await?;
            }
            let take = self.buffered().min(out.len() - done);
            out[done..done + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.consume(take);
            done += take;
        }
        Ok(())
    }

    /// Consumes `tok` at the cursor, or fails with a parse error.
    pub async fn expect(&mut self, tok: &str) -> Result<(), XmlRpcError> {
        for &want in tok.as_bytes() {
            let got = self.next_byte().await?;
            if got != want {
                return Err(XmlRpcError::Parse(format!(
                    "expected {:?} (mismatch at {:?})",
                    tok, got as char
                )));
            }
        }
        Ok(())
    }

    /// Case-insensitive [`XmlRpcParser::expect`].
    pub async fn expect_nocase(&mut self, tok: &str) -> Result<(), XmlRpcError> {
        for &want in tok.as_bytes() {
            let got = self.next_byte().await?;
            if !got.eq_ignore_ascii_case(&want) {
                return Err(XmlRpcError::Parse(format!(
                    "expected {:?} (mismatch at {:?})",
                    tok, got as char
                )));
            }
        }
        Ok(())
    }

    /// Quiet match: consumes `tok` iff the next bytes equal it, otherwise
    /// leaves the cursor alone. Used for ordered alternative matching.
    pub async fn try_expect(&mut self, tok: &str) -> Result<bool, XmlRpcError> {
        let bytes = tok.as_bytes();
        self.ensure(bytes.len()).await?;
        if &self.buf[self.pos..self.pos + bytes.len()] == bytes {
            self.consume(bytes.len());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Non-consuming single-character match.
    pub async fn look_ahead(&mut self, wanted: char) -> Result<(), XmlRpcError> {
        let got = self.peek().await?;
        if got == wanted as u8 {
            Ok(())
        } else {
            Err(XmlRpcError::Parse(format!(
                "expected {:?}, found {:?}",
                wanted, got as char
            )))
        }
    }

    /// Skips `n` bytes.
    pub async fn skip(&mut self, mut n: u64) -> Result<(), XmlRpcError> {
        while n > 0 {
            if self.body_remaining() == Some(0) {
                return Err(XmlRpcError::Eof);
            }
            if self.buffered() == 0 {
                self.refill().await?;
            }
            let mut take = (self.buffered() as u64).min(n);
            if let Some(remaining) = self.body_remaining() {
                take = take.min(remaining);
            }
            self.consume(take as usize);
            n -= take;
        }
        Ok(())
    }

    /// Skips up to (not including) the next occurrence of `stop`.
    pub async fn skip_until(&mut self, stop: u8) -> Result<(), XmlRpcError> {
        loop {
            if self.peek().await? == stop {
                return Ok(());
            }
            self.consume(1);
        }
    }

    /// Skips past the next occurrence of `tok`.
    pub async fn skip_after(&mut self, tok: &str) -> Result<(), XmlRpcError> {
        let bytes = tok.as_bytes();
        let mut matched = 0;
        loop {
            let byte = self.next_byte().await?;
            if byte == bytes[matched] {
                matched += 1;
                if matched == bytes.len() {
                    return Ok(());
                }
            } else {
                matched = usize::from(byte == bytes[0]);
            }
        }
    }

    /// Skips any run of whitespace (possibly empty).
    pub async fn skip_ws(&mut self) -> Result<(), XmlRpcError> {
        loop {
            if self.buffered() == 0 {
                // Whitespace runs never legitimately end the stream mid-
                // message, so a refill failure here still surfaces as Eof
                // on the next primitive rather than being swallowed.
                self.refill().await?;
            }
            while self.buffered() > 0 {
                if is_ws(self.buf[self.pos]) {
                    self.consume(1);
                } else {
                    return Ok(());
                }
            }
        }
    }

    /// Requires at least one whitespace byte, then skips the rest of the run.
    pub async fn expect_ws(&mut self) -> Result<(), XmlRpcError> {
        let byte = self.next_byte().await?;
        if !is_ws(byte) {
            return Err(XmlRpcError::Parse(format!(
                "expected whitespace, found {:?}",
                byte as char
            )));
        }
        self.skip_ws().await
    }

    /// Decimal unsigned integer, at least one digit.
    pub async fn uint32(&mut self) -> Result<u32, XmlRpcError> {
        let mut value: u64 = 0;
        let mut digits = 0;
        loop {
            let byte = self.peek().await?;
            if byte.is_ascii_digit() {
                value = value * 10 + u64::from(byte - b'0');
                if value > u64::from(u32::MAX) {
                    return Err(XmlRpcError::Parse("integer out of range".to_owned()));
                }
                self.consume(1);
                digits += 1;
            } else if digits == 0 {
                return Err(XmlRpcError::Parse(format!(
                    "expected a digit, found {:?}",
                    byte as char
                )));
            } else {
                return Ok(value as u32);
            }
        }
    }

    /// Decimal signed integer, optional sign prefix.
    pub async fn int32(&mut self) -> Result<i32, XmlRpcError> {
        let negative = match self.peek().await? {
            b'-' => {
                self.consume(1);
                true
            }
            b'+' => {
                self.consume(1);
                false
            }
            _ => false,
        };
        let magnitude = i64::from(self.uint32().await?);
        let value = if negative { -magnitude } else { magnitude };
        i32::try_from(value).map_err(|_| XmlRpcError::Parse("integer out of range".to_owned()))
    }

    /// Simplified double: optional sign, integral part, optional fractional
    /// part. No scientific notation, matching what the ROS APIs emit.
    pub async fn double(&mut self) -> Result<f64, XmlRpcError> {
        let mut text = String::new();
        match self.peek().await? {
            sign @ (b'-' | b'+') => {
                text.push(sign as char);
                self.consume(1);
            }
            _ => {}
        }
        let mut digits = 0;
        loop {
            let byte = self.peek().await?;
            if byte.is_ascii_digit() || (byte == b'.' && !text.contains('.')) {
                text.push(byte as char);
                digits += u32::from(byte.is_ascii_digit());
                self.consume(1);
            } else {
                break;
            }
        }
        if digits == 0 {
            return Err(XmlRpcError::Parse("expected a number".to_owned()));
        }
        text.parse::<f64>()
            .map_err(|err| XmlRpcError::Parse(format!("bad double {:?}: {}", text, err)))
    }

    /// Captures text up to (not including) the next `<`, bounded by the read
    /// buffer size.
    async fn text_until_lt(&mut self) -> Result<String, XmlRpcError> {
        let mut text = Vec::new();
        loop {
            let byte = self.peek().await?;
            if byte == b'<' {
                break;
            }
            if text.len() == READ_BUFFER_LEN {
                return Err(XmlRpcError::Parse("text exceeds the read buffer".to_owned()));
            }
            text.push(byte);
            self.consume(1);
        }
        String::from_utf8(text).map_err(|_| XmlRpcError::Parse("text is not valid UTF-8".to_owned()))
    }

    /// Consumes `<`, transparently skipping any `<!-- … -->` comments (and
    /// surrounding whitespace) that precede the tag.
    async fn xml_tag_begin(&mut self) -> Result<(), XmlRpcError> {
        loop {
            self.skip_ws().await?;
            self.expect("<").await?;
            if self.try_expect("!--").await? {
                self.skip_after("-->").await?;
                continue;
            }
            return Ok(());
        }
    }

    /// Consumes an opening tag `<name>`.
    pub async fn xml_tag_open(&mut self, name: &str) -> Result<(), XmlRpcError> {
        self.xml_tag_begin().await?;
        self.expect(name).await?;
        self.skip_ws().await?;
        self.expect(">").await
    }

    /// Consumes a closing tag `</name>`.
    pub async fn xml_tag_close(&mut self, name: &str) -> Result<(), XmlRpcError> {
        self.xml_tag_begin().await?;
        self.expect("/").await?;
        self.expect(name).await?;
        self.skip_ws().await?;
        self.expect(">").await
    }

    /// Quiet variant of [`XmlRpcParser::xml_tag_close`]; consumes nothing on
    /// mismatch (apart from leading whitespace/comments... which only ever
    /// sit between tags anyway).
    async fn try_xml_tag_close(&mut self, name: &str) -> Result<bool, XmlRpcError> {
        self.skip_ws().await?;
        self.try_expect(&format!("</{}>", name)).await
    }

    /// Consumes an XML attribute `name="value"`; both quote styles accepted.
    /// Returns the raw attribute value.
    pub async fn xml_attr(&mut self, name: &str) -> Result<String, XmlRpcError> {
        self.expect(name).await?;
        self.skip_ws().await?;
        self.expect("=").await?;
        self.skip_ws().await?;
        let quote = self.next_byte().await?;
        if quote != b'"' && quote != b'\'' {
            return Err(XmlRpcError::Parse("expected a quoted attribute".to_owned()));
        }
        let mut value = String::new();
        loop {
            let byte = self.next_byte().await?;
            if byte == quote {
                return Ok(value);
            }
            if value.len() == READ_BUFFER_LEN {
                return Err(XmlRpcError::Parse("attribute exceeds the read buffer".to_owned()));
            }
            value.push(byte as char);
        }
    }

    /// Accepts `<?xml version="1.0" [encoding="…"] [standalone="…"]?>` with
    /// the optional attributes in either order.
    pub async fn xml_header(&mut self) -> Result<(), XmlRpcError> {
        self.skip_ws().await?;
        self.expect("<?xml").await?;
        self.expect_ws().await?;
        let version = self.xml_attr("version").await?;
        if version != "1.0" {
            return Err(XmlRpcError::Parse(format!(
                "unsupported XML version {:?}",
                version
            )));
        }
        loop {
            self.skip_ws().await?;
            if self.try_expect("?>").await? {
                return Ok(());
            }
            if self.try_expect("encoding").await? {
                self.finish_attr().await?;
            } else if self.try_expect("standalone").await? {
                self.finish_attr().await?;
            } else {
                return Err(XmlRpcError::Parse("bad XML header attribute".to_owned()));
            }
        }
    }

    /// Consumes `="value"` after an already-matched attribute name.
    async fn finish_attr(&mut self) -> Result<(), XmlRpcError> {
        self.skip_ws().await?;
        self.expect("=").await?;
        self.skip_ws().await?;
        let quote = self.next_byte().await?;
        if quote != b'"' && quote != b'\'' {
            return Err(XmlRpcError::Parse("expected a quoted attribute".to_owned()));
        }
        self.skip_until(quote).await?;
        self.consume(1);
        Ok(())
    }

    /// Parses the HTTP request line and headers of an XMLRPC POST, leaving
    /// the cursor at the body start. `POST /` and `POST /RPC2` are the only
    /// accepted request targets.
    pub async fn http_request(&mut self) -> Result<HttpRequest, XmlRpcError> {
        self.expect("POST").await?;
        self.expect_ws().await?;
        self.expect("/").await?;
        let _ = self.try_expect("RPC2").await?;
        self.expect_ws().await?;
        self.expect("HTTP/1.").await?;
        match self.next_byte().await? {
            b'0' | b'1' => {}
            other => {
                return Err(XmlRpcError::Parse(format!(
                    "bad HTTP version digit {:?}",
                    other as char
                )))
            }
        }
        self.expect("\r\n").await?;
        let (content_length, content_type) = self.http_headers().await?;
        match content_type {
            Some(kind) if kind.starts_with("text/xml") => {}
            Some(kind) => {
                return Err(XmlRpcError::Parse(format!(
                    "unsupported Content-Type {:?}",
                    kind
                )))
            }
            None => return Err(XmlRpcError::Parse("missing Content-Type".to_owned())),
        }
        self.begin_body(content_length);
        Ok(HttpRequest {
            content_length: content_length as usize,
        })
    }

    /// Parses an HTTP status line and headers, returning the status code and
    /// leaving the cursor at the body start.
    pub async fn http_response(&mut self) -> Result<u16, XmlRpcError> {
        self.expect("HTTP/1.").await?;
        match self.next_byte().await? {
            b'0' | b'1' => {}
            other => {
                return Err(XmlRpcError::Parse(format!(
                    "bad HTTP version digit {:?}",
                    other as char
                )))
            }
        }
        self.expect_ws().await?;
        let code = self.uint32().await?;
        self.skip_after("\r\n").await?;
        let (content_length, _content_type) = self.http_headers().await?;
        self.begin_body(content_length);
        Ok(code as u16)
    }

    /// Scans HTTP headers case-insensitively, capturing `Content-Length`
    /// (required) and `Content-Type`; unknown headers are skipped.
    async fn http_headers(&mut self) -> Result<(u64, Option<String>), XmlRpcError> {
        let mut content_length: Option<u64> = None;
        let mut content_type: Option<String> = None;
        loop {
            if self.try_expect("\r\n").await? {
                break;
            }
            let mut name = String::new();
            loop {
                let byte = self.next_byte().await?;
                if byte == b':' {
                    break;
                }
                if byte == b'\r' || byte == b'\n' {
                    return Err(XmlRpcError::Parse("malformed HTTP header".to_owned()));
                }
                if name.len() < HEADER_NAME_LEN {
                    name.push(byte.to_ascii_lowercase() as char);
                }
            }
            // Inline whitespace only; CRLF terminates the value.
            while matches!(self.peek().await?, b' ' | b'\t') {
                self.consume(1);
            }
            let mut value = String::new();
            loop {
                let byte = self.next_byte().await?;
                if byte == b'\r' {
                    self.expect("\n").await?;
                    break;
                }
                if value.len() < READ_BUFFER_LEN {
                    value.push(byte as char);
                }
            }
            match name.as_str() {
                "content-length" => {
                    let parsed = value.trim().parse::<u64>().map_err(|_| {
                        XmlRpcError::Parse(format!("bad Content-Length {:?}", value))
                    })?;
                    content_length = Some(parsed);
                }
                "content-type" => content_type = Some(value.trim().to_owned()),
                _ => {}
            }
        }
        let content_length =
            content_length.ok_or_else(|| XmlRpcError::Parse("missing Content-Length".to_owned()))?;
        Ok((content_length, content_type))
    }

    fn begin_body(&mut self, content_length: u64) {
        self.content_length = Some(content_length);
        self.mark = self.total;
    }

    /// Consumes whatever of the declared body is still unread. Called after
    /// an envelope so trailing padding never desynchronizes the stream.
    pub async fn drain_body(&mut self) -> Result<(), XmlRpcError> {
        let length = self
            .content_length
            .ok_or_else(|| XmlRpcError::Parse("drain before the HTTP headers".to_owned()))?;
        let remaining = length
            .checked_sub(self.body_consumed())
            .ok_or_else(|| XmlRpcError::Parse("consumed past the declared body".to_owned()))?;
        self.skip(remaining).await
    }

    /// Parses one `<value>…</value>`, dispatching on the inner tag.
    pub fn value(&mut self) -> Pin<Box<dyn Future<Output = Result<XmlRpcValue, XmlRpcError>> + Send + '_>>
    where
        R: Send,
    {
        Box::pin(async move {
            self.xml_tag_begin().await?;
            self.expect("value").await?;
            self.skip_ws().await?;
            self.expect(">").await?;
            if self.try_expect("</value>").await? {
                return Ok(XmlRpcValue::String(String::new()));
            }
            if self.try_expect("<i4>").await? {
                let value = self.int32().await?;
                self.expect("</i4>").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::Int(value));
            }
            if self.try_expect("<int>").await? {
                let value = self.int32().await?;
                self.expect("</int>").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::Int(value));
            }
            if self.try_expect("<boolean>").await? {
                let value = match self.next_byte().await? {
                    b'0' => false,
                    b'1' => true,
                    other => {
                        return Err(XmlRpcError::Parse(format!(
                            "bad boolean {:?}",
                            other as char
                        )))
                    }
                };
                self.expect("</boolean>").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::Bool(value));
            }
            if self.try_expect("<string>").await? {
                let value = self.text_until_lt().await?;
                self.expect("</string>").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::String(value));
            }
            if self.try_expect("<double>").await? {
                let value = self.double().await?;
                self.expect("</double>").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::Double(value));
            }
            if self.try_expect("<base64>").await? {
                // Accepted syntactically; the content is not decoded.
                warn!("skipping a <base64> value (not supported)");
                self.skip_until(b'<').await?;
                self.expect("</base64>").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::String(String::new()));
            }
            if self.try_expect("<struct>").await? {
                // Accepted syntactically; members are skipped (flat values only).
                warn!("skipping a <struct> value (not supported)");
                self.skip_after("</struct>").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::Struct);
            }
            if self.try_expect("<array>").await? {
                self.skip_ws().await?;
                self.expect("<data>").await?;
                let mut values = Vec::new();
                loop {
                    self.skip_ws().await?;
                    if self.try_expect("</data>").await? {
                        break;
                    }
                    values.push(self.value().await?);
                }
                self.xml_tag_close("array").await?;
                self.xml_tag_close("value").await?;
                return Ok(XmlRpcValue::Array(values));
            }
            // Bare text inside <value> is a string.
            let value = self.text_until_lt().await?;
            self.expect("</value>").await?;
            Ok(XmlRpcValue::String(value))
        })
    }

    /// Parses a full `methodResponse` envelope: the standard 3-element array
    /// `[code, statusMessage, value]`. Drains the rest of the declared body.
    pub async fn method_response(&mut self) -> Result<(i32, String, XmlRpcValue), XmlRpcError>
    where
        R: Send,
    {
        self.xml_header().await?;
        self.xml_tag_open("methodResponse").await?;
        self.xml_tag_open("params").await?;
        self.xml_tag_open("param").await?;
        self.xml_tag_open("value").await?;
        self.xml_tag_open("array").await?;
        self.xml_tag_open("data").await?;
        let code = self.value().await?.as_int()?;
        let status = match self.value().await? {
            XmlRpcValue::String(text) => text,
            other => {
                return Err(XmlRpcError::Parse(format!(
                    "statusMessage has class {}",
                    other.class_name()
                )))
            }
        };
        let payload = self.value().await?;
        self.xml_tag_close("data").await?;
        self.xml_tag_close("array").await?;
        self.xml_tag_close("value").await?;
        self.xml_tag_close("param").await?;
        self.xml_tag_close("params").await?;
        self.xml_tag_close("methodResponse").await?;
        self.drain_body().await?;
        Ok((code, status, payload))
    }

    /// Parses a `methodCall` envelope, returning the method name and its
    /// positional parameters.
    pub async fn method_call(&mut self) -> Result<(String, Vec<XmlRpcValue>), XmlRpcError>
    where
        R: Send,
    {
        self.xml_header().await?;
        self.xml_tag_open("methodCall").await?;
        self.xml_tag_open("methodName").await?;
        let name = self.text_until_lt().await?;
        if name.is_empty() || name.len() > HEADER_NAME_LEN {
            return Err(XmlRpcError::Parse(format!("bad method name {:?}", name)));
        }
        self.expect("</methodName>").await?;
        self.xml_tag_open("params").await?;
        let mut params = Vec::new();
        loop {
            if self.try_xml_tag_close("params").await? {
                break;
            }
            self.xml_tag_open("param").await?;
            params.push(self.value().await?);
            self.xml_tag_close("param").await?;
        }
        self.xml_tag_close("methodCall").await?;
        Ok((name, params))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parser(bytes: &'static [u8]) -> XmlRpcParser<&'static [u8]> {
        XmlRpcParser::new(bytes)
    }

    #[tokio::test]
    async fn parses_int_value() {
        let mut p = parser(b"<value><int>42</int></value>");
        assert_eq!(p.value().await.unwrap(), XmlRpcValue::Int(42));
    }

    #[tokio::test]
    async fn parses_i4_and_signs() {
        let mut p = parser(b"<value><i4>-2147483648</i4></value>");
        assert_eq!(p.value().await.unwrap(), XmlRpcValue::Int(i32::MIN));
        let mut p = parser(b"<value><i4>+17</i4></value>");
        assert_eq!(p.value().await.unwrap(), XmlRpcValue::Int(17));
    }

    #[tokio::test]
    async fn parses_bare_string_value() {
        let mut p = parser(b"<value>hello</value>");
        assert_eq!(
            p.value().await.unwrap(),
            XmlRpcValue::String("hello".to_owned())
        );
    }

    #[tokio::test]
    async fn parses_empty_value_as_empty_string() {
        let mut p = parser(b"<value></value>");
        assert_eq!(p.value().await.unwrap(), XmlRpcValue::String(String::new()));
    }

    #[tokio::test]
    async fn parses_nested_array() {
        let mut p = parser(
            b"<value><array><data>\n  <value><boolean>1</boolean></value>\n  <value><array><data><value>x</value></data></array></value>\n</data></array></value>",
        );
        assert_eq!(
            p.value().await.unwrap(),
            XmlRpcValue::Array(vec![
                XmlRpcValue::Bool(true),
                XmlRpcValue::Array(vec![XmlRpcValue::String("x".to_owned())]),
            ])
        );
    }

    #[tokio::test]
    async fn bad_boolean_is_a_parse_error() {
        let mut p = parser(b"<value><boolean>2</boolean></value>");
        assert!(matches!(p.value().await, Err(XmlRpcError::Parse(_))));
    }

    #[tokio::test]
    async fn base64_is_skipped_to_an_empty_string() {
        let mut p = parser(b"<value><base64>aGVsbG8=</base64></value>");
        assert_eq!(p.value().await.unwrap(), XmlRpcValue::String(String::new()));
    }

    #[tokio::test]
    async fn struct_members_are_skipped() {
        let mut p = parser(
            b"<value><struct><member><name>k</name><value><int>1</int></value></member></struct></value>",
        );
        assert_eq!(p.value().await.unwrap(), XmlRpcValue::Struct);
    }

    #[tokio::test]
    async fn comments_are_transparent_between_tags() {
        let mut p = parser(b"<!-- hi --> <value><int>7</int></value>");
        assert_eq!(p.value().await.unwrap(), XmlRpcValue::Int(7));
    }

    #[tokio::test]
    async fn xml_header_accepts_reordered_attributes() {
        let mut p = parser(b"<?xml version=\"1.0\" standalone=\"no\"?>");
        p.xml_header().await.unwrap();
        let mut p = parser(b"<?xml version='1.0' standalone='no' encoding='US-ASCII'?>");
        p.xml_header().await.unwrap();
    }

    #[tokio::test]
    async fn xml_header_rejects_other_versions() {
        let mut p = parser(b"<?xml version=\"2.0\"?>");
        assert!(matches!(p.xml_header().await, Err(XmlRpcError::Parse(_))));
    }

    #[tokio::test]
    async fn parses_http_request_and_tracks_body_mark() {
        let mut p = parser(
            b"POST /RPC2 HTTP/1.0\r\nHost: somewhere\r\nContent-Type: text/xml\r\nContent-Length: 16\r\n\r\n<value>7</value>",
        );
        let req = p.http_request().await.unwrap();
        assert_eq!(req.content_length, 16);
        assert_eq!(p.body_consumed(), 0);
        p.expect("<value>").await.unwrap();
        assert_eq!(p.body_consumed(), 7);
    }

    #[tokio::test]
    async fn http_request_requires_text_xml() {
        let mut p = parser(
            b"POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
        );
        assert!(matches!(p.http_request().await, Err(XmlRpcError::Parse(_))));
    }

    #[tokio::test]
    async fn http_headers_are_case_insensitive() {
        let mut p = parser(
            b"POST / HTTP/1.1\r\ncOnTeNt-TyPe: text/xml\r\nCONTENT-LENGTH: 0\r\nX-Whatever: skipped\r\n\r\n",
        );
        let req = p.http_request().await.unwrap();
        assert_eq!(req.content_length, 0);
    }

    #[tokio::test]
    async fn http_response_returns_the_code() {
        let mut p = parser(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(p.http_response().await.unwrap(), 404);
    }

    #[tokio::test]
    async fn refill_never_reads_past_the_declared_body() {
        // Two byte body followed by trailing garbage: drain must stop at the
        // declared length and the next read must see the garbage untouched.
        let mut p = parser(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nabEXTRA");
        p.http_response().await.unwrap();
        p.drain_body().await.unwrap();
        assert_eq!(p.body_consumed(), 2);
        assert!(matches!(p.skip(1).await, Err(XmlRpcError::Eof)));
    }

    #[tokio::test]
    async fn parses_method_response_envelope() {
        let body = b"<?xml version=\"1.0\"?><methodResponse><params><param><value><array><data><value><int>1</int></value><value></value><value><array><data><value>http://sub:1234</value></data></array></value></data></array></value></param></params></methodResponse>";
        let mut bytes = format!(
            "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n",
            body.len() + 3
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(b"\n\n\n");
        let leaked: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let mut p = XmlRpcParser::new(leaked);
        p.http_response().await.unwrap();
        let (code, status, payload) = p.method_response().await.unwrap();
        assert_eq!(code, 1);
        assert_eq!(status, "");
        assert_eq!(
            payload,
            XmlRpcValue::Array(vec![XmlRpcValue::String("http://sub:1234".to_owned())])
        );
    }

    #[tokio::test]
    async fn parses_method_call_envelope() {
        let body = b"<?xml version=\"1.0\"?><methodCall><methodName>requestTopic</methodName><params><param><value>/caller</value></param><param><value>/chatter</value></param><param><value><array><data><value><array><data><value>TCPROS</value></data></array></value></data></array></value></param></params></methodCall>";
        let mut bytes = format!(
            "POST /RPC2 HTTP/1.0\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        let leaked: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let mut p = XmlRpcParser::new(leaked);
        p.http_request().await.unwrap();
        let (name, params) = p.method_call().await.unwrap();
        assert_eq!(name, "requestTopic");
        assert_eq!(params.len(), 3);
        assert_eq!(params[0], XmlRpcValue::String("/caller".to_owned()));
        assert_eq!(
            params[2],
            XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::String(
                "TCPROS".to_owned()
            )])])
        );
    }
}
