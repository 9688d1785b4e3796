use crate::master::MasterClient;
use crate::names::split_rosrpc_uri;
use crate::tcpros::{self, ConnectionHeader};
use crate::TCPROS_TIMEOUT;
use embros_common::{Error, RosServiceType};
use log::*;
use std::{marker::PhantomData, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::timeout,
};

/// A typed client for one remote service.
///
/// Each call resolves the provider through the Master, connects, performs
/// the TCPROS service handshake and exchanges one request/response. With
/// `persistent` the connection is kept and reused for subsequent calls.
pub struct ServiceClient<T> {
    inner: Arc<ServiceClientInner>,
    _phantom: PhantomData<T>,
}

impl<T: RosServiceType> ServiceClient<T> {
    pub(crate) fn new(
        caller_id: &str,
        service_name: &str,
        persistent: bool,
        master: MasterClient,
    ) -> Self {
        let header = ConnectionHeader {
            caller_id: caller_id.to_owned(),
            service: Some(service_name.to_owned()),
            topic_type: T::ROS_SERVICE_NAME.to_owned(),
            md5sum: Some(T::MD5SUM.to_owned()),
            request_type: Some(format!("{}Request", T::ROS_SERVICE_NAME)),
            response_type: Some(format!("{}Response", T::ROS_SERVICE_NAME)),
            persistent,
            ..Default::default()
        };
        Self {
            inner: Arc::new(ServiceClientInner {
                service_name: service_name.to_owned(),
                persistent,
                header,
                master,
                connection: Mutex::new(None),
            }),
            _phantom: PhantomData,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub async fn call(&self, request: &T::Request) -> Result<T::Response, Error> {
        let request = serde_rosmsg::to_vec(request)
            .map_err(|err| Error::SerializationError(err.to_string()))?;
        let response = self.inner.call_raw(request).await?;
        serde_rosmsg::from_slice(&response).map_err(|err| Error::SerializationError(err.to_string()))
    }
}

struct ServiceClientInner {
    service_name: String,
    persistent: bool,
    header: ConnectionHeader,
    master: MasterClient,
    connection: Mutex<Option<TcpStream>>,
}

impl ServiceClientInner {
    async fn call_raw(&self, request: Vec<u8>) -> Result<Vec<u8>, Error> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let stream = guard.as_mut().expect("connection was just established");
        let result = self.exchange(stream, &request).await;
        match result {
            Ok(response) => {
                if !self.persistent {
                    if let Some(mut stream) = guard.take() {
                        let _ = stream.shutdown().await;
                    }
                }
                Ok(response)
            }
            Err(err) => {
                // Whatever went wrong, the stream state is unknown now.
                if let Some(mut stream) = guard.take() {
                    let _ = stream.shutdown().await;
                }
                Err(err)
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, Error> {
        let service_api = self.master.lookup_service(&self.service_name).await?;
        let (host, port) = split_rosrpc_uri(&service_api)?;
        debug!(
            "Connecting to service {} at {}:{}",
            self.service_name, host, port
        );
        let mut stream = timeout(TCPROS_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {host}:{port}")))??;

        let header_bytes = self.header.to_bytes(true)?;
        timeout(TCPROS_TIMEOUT, stream.write_all(&header_bytes))
            .await
            .map_err(|_| Error::Timeout("sending the handshake".to_owned()))??;

        let responded = timeout(TCPROS_TIMEOUT, tcpros::receive_header(&mut stream, true))
            .await
            .map_err(|_| Error::Timeout("awaiting the handshake".to_owned()))?
            .map_err(Error::from)?;

        // Validating a response is exact; the wildcard allowance only exists
        // on the server side accepting a request.
        if responded.md5sum != self.header.md5sum {
            return Err(Error::SerializationError(format!(
                "md5sums do not match on {}",
                self.service_name
            )));
        }
        Ok(stream)
    }

    /// One request / status-byte / response exchange.
    async fn exchange(&self, stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>, Error> {
        timeout(TCPROS_TIMEOUT, stream.write_all(request))
            .await
            .map_err(|_| Error::Timeout("sending the request".to_owned()))??;

        let status = timeout(TCPROS_TIMEOUT, stream.read_u8())
            .await
            .map_err(|_| Error::Timeout("awaiting the response".to_owned()))??;
        match status {
            1 => {
                let response = timeout(TCPROS_TIMEOUT, tcpros::read_message(stream))
                    .await
                    .map_err(|_| Error::Timeout("awaiting the response body".to_owned()))?
                    .map_err(Error::from)?;
                Ok(response)
            }
            0 => {
                let text = timeout(TCPROS_TIMEOUT, tcpros::read_frame(stream))
                    .await
                    .map_err(|_| Error::Timeout("awaiting the error text".to_owned()))?
                    .map_err(Error::from)?;
                Err(Error::ServerError(
                    String::from_utf8_lossy(&text).into_owned(),
                ))
            }
            other => Err(Error::Protocol(format!(
                "bad service status byte {}",
                other
            ))),
        }
    }
}
