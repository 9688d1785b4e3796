use super::{XmlRpcError, XmlRpcParser, XmlRpcStreamer, XmlRpcValue};
use crate::names::split_http_uri;
use crate::XMLRPC_TIMEOUT;
use log::*;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Performs one XMLRPC method call against `uri` (`http://host:port`).
///
/// Returns the raw `[code, statusMessage, value]` triple; interpreting the
/// code is the caller's business. Any transport failure, non-200 HTTP
/// status or malformed envelope is an error.
pub async fn call_method(
    uri: &str,
    method: &str,
    params: &[XmlRpcValue],
) -> Result<(i32, String, XmlRpcValue), XmlRpcError> {
    let (host, port) = split_http_uri(uri).map_err(|_| {
        XmlRpcError::BadParam(format!("malformed XMLRPC URI {:?}", uri))
    })?;
    call_method_cfg(&host, port, method, params, false).await
}

/// [`call_method`] addressed by host and port.
pub async fn call_method_at(
    host: &str,
    port: u16,
    method: &str,
    params: &[XmlRpcValue],
) -> Result<(i32, String, XmlRpcValue), XmlRpcError> {
    call_method_cfg(host, port, method, params, false).await
}

/// Full-control call used by the master client: `fixed_length` selects the
/// legacy fixed-width `Content-Length` framing.
pub(crate) async fn call_method_cfg(
    host: &str,
    port: u16,
    method: &str,
    params: &[XmlRpcValue],
    fixed_length: bool,
) -> Result<(i32, String, XmlRpcValue), XmlRpcError> {
    trace!("calling {} on {}:{}", method, host, port);
    let stream = timeout(XMLRPC_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| XmlRpcError::Timeout)?
        .map_err(|err| {
            debug!("connect to {}:{} failed: {}", host, port, err);
            XmlRpcError::NoConn
        })?;
    let (read_half, write_half) = stream.into_split();

    let mut streamer = XmlRpcStreamer::new(write_half).fixed_content_length(fixed_length);
    streamer.method_call(method, params);
    timeout(XMLRPC_TIMEOUT, streamer.send_request(host))
        .await
        .map_err(|_| XmlRpcError::Timeout)??;

    let mut parser = XmlRpcParser::new(read_half);
    let triple = timeout(XMLRPC_TIMEOUT, async {
        let status = parser.http_response().await?;
        if status != 200 {
            return Err(XmlRpcError::BadConn(format!(
                "{} answered HTTP {}",
                method, status
            )));
        }
        parser.method_response().await
    })
    .await
    .map_err(|_| XmlRpcError::Timeout)??;

    trace!("{} on {}:{} -> code {}", method, host, port, triple.0);
    Ok(triple)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A one-shot XMLRPC endpoint answering with canned response parts.
    async fn serve_one(code: i32, status: &str, payload: XmlRpcValue) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = status.to_owned();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Read the request up to the end of its declared body.
            let mut parser = XmlRpcParser::new(&mut stream);
            parser.http_request().await.unwrap();
            let (_name, _params) = parser.method_call().await.unwrap();
            parser.drain_body().await.unwrap();
            let mut streamer = XmlRpcStreamer::new(&mut stream);
            streamer.method_response(code, &status, &payload);
            streamer.send_response(200).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        addr
    }

    #[test_log::test(tokio::test)]
    async fn calls_a_live_endpoint() {
        let addr = serve_one(1, "", XmlRpcValue::Int(4321)).await;
        let (code, status, payload) = call_method_at(
            &addr.ip().to_string(),
            addr.port(),
            "getPid",
            &[XmlRpcValue::String("/caller".to_owned())],
        )
        .await
        .unwrap();
        assert_eq!(code, 1);
        assert_eq!(status, "");
        assert_eq!(payload, XmlRpcValue::Int(4321));
    }

    #[test_log::test(tokio::test)]
    async fn legacy_framing_interoperates() {
        let addr = serve_one(1, "ok", XmlRpcValue::String("x".to_owned())).await;
        let (code, _, _) = call_method_cfg(
            &addr.ip().to_string(),
            addr.port(),
            "getPid",
            &[XmlRpcValue::String("/caller".to_owned())],
            true,
        )
        .await
        .unwrap();
        assert_eq!(code, 1);
    }

    #[test_log::test(tokio::test)]
    async fn http_error_status_is_bad_conn() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 4096];
            let _ = stream.read(&mut sink).await;
            stream
                .write_all(b"HTTP/1.0 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });
        let result = call_method_at(
            &addr.ip().to_string(),
            addr.port(),
            "getPid",
            &[XmlRpcValue::String("/caller".to_owned())],
        )
        .await;
        assert!(matches!(result, Err(XmlRpcError::BadConn(_))));
    }

    #[test_log::test(tokio::test)]
    async fn refused_connection_is_no_conn() {
        // Bind-then-drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = call_method_at(&addr.ip().to_string(), addr.port(), "getPid", &[]).await;
        assert!(matches!(result, Err(XmlRpcError::NoConn)));
    }
}
