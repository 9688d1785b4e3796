//! Typed client wrappers for the rosmaster XMLRPC API.
//!
//! Every wrapper goes through one generic call path: the method name and
//! parameter list go out, the `[code, statusMessage, value]` triple comes
//! back, and the payload is coerced to the class that method promises.
//! A payload of the wrong class is treated as a connection-level fault, the
//! same as a non-200 HTTP status.

use crate::names::split_http_uri;
use crate::xmlrpc::{call_method_cfg, code, XmlRpcError, XmlRpcValue};

/// A snapshot of the ROS graph as reported by `getSystemState`.
#[derive(Debug, Default, Clone)]
pub struct SystemState {
    /// topic name -> publishing node names
    pub publishers: Vec<(String, Vec<String>)>,
    /// topic name -> subscribing node names
    pub subscribers: Vec<(String, Vec<String>)>,
    /// service name -> providing node names
    pub services: Vec<(String, Vec<String>)>,
}

/// A client for one rosmaster, bound to the identity of the local node.
///
/// `caller_id` is the node name and `caller_api` the node's advertised
/// XMLRPC URI; both ride along on every request, as the Master API demands.
#[derive(Clone, Debug)]
pub struct MasterClient {
    host: String,
    port: u16,
    caller_id: String,
    caller_api: String,
    fixed_length: bool,
}

impl MasterClient {
    pub fn new(master_uri: &str, caller_id: &str, caller_api: &str) -> Result<Self, XmlRpcError> {
        let (host, port) = split_http_uri(master_uri)
            .map_err(|_| XmlRpcError::BadParam(format!("malformed master URI {:?}", master_uri)))?;
        Ok(Self {
            host,
            port,
            caller_id: caller_id.to_owned(),
            caller_api: caller_api.to_owned(),
            fixed_length: false,
        })
    }

    /// Selects the legacy fixed-width `Content-Length` framing for every
    /// request, for masters that check the header before parsing.
    pub fn fixed_content_length(mut self, on: bool) -> Self {
        self.fixed_length = on;
        self
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    async fn call(
        &self,
        method: &str,
        mut params: Vec<XmlRpcValue>,
    ) -> Result<XmlRpcValue, XmlRpcError> {
        params.insert(0, XmlRpcValue::string(&self.caller_id));
        let (status_code, status, payload) =
            call_method_cfg(&self.host, self.port, method, &params, self.fixed_length).await?;
        match status_code {
            code::SUCCESS => Ok(payload),
            code::FAILURE => Err(XmlRpcError::BadParam(format!(
                "{} failed: {}",
                method, status
            ))),
            _ => Err(XmlRpcError::BadConn(format!(
                "{} errored: {}",
                method, status
            ))),
        }
    }

    /// Liveness probe: asks the Master for its PID.
    pub async fn get_pid(&self) -> Result<i32, XmlRpcError> {
        self.call("getPid", vec![]).await?.as_int()
    }

    /// Registers the local node as a publisher; returns the XMLRPC URIs of
    /// the current subscribers.
    pub async fn register_publisher(
        &self,
        topic: &str,
        topic_type: &str,
    ) -> Result<Vec<String>, XmlRpcError> {
        let payload = self
            .call(
                "registerPublisher",
                vec![
                    XmlRpcValue::string(topic),
                    XmlRpcValue::string(topic_type),
                    XmlRpcValue::string(&self.caller_api),
                ],
            )
            .await?;
        string_list(payload)
    }

    pub async fn unregister_publisher(&self, topic: &str) -> Result<i32, XmlRpcError> {
        self.call(
            "unregisterPublisher",
            vec![
                XmlRpcValue::string(topic),
                XmlRpcValue::string(&self.caller_api),
            ],
        )
        .await?
        .as_int()
    }

    /// Registers the local node as a subscriber; returns the XMLRPC URIs of
    /// the current publishers, which the caller is expected to connect to.
    pub async fn register_subscriber(
        &self,
        topic: &str,
        topic_type: &str,
    ) -> Result<Vec<String>, XmlRpcError> {
        let payload = self
            .call(
                "registerSubscriber",
                vec![
                    XmlRpcValue::string(topic),
                    XmlRpcValue::string(topic_type),
                    XmlRpcValue::string(&self.caller_api),
                ],
            )
            .await?;
        string_list(payload)
    }

    pub async fn unregister_subscriber(&self, topic: &str) -> Result<i32, XmlRpcError> {
        self.call(
            "unregisterSubscriber",
            vec![
                XmlRpcValue::string(topic),
                XmlRpcValue::string(&self.caller_api),
            ],
        )
        .await?
        .as_int()
    }

    /// `service_api` is the `rosrpc://host:port` endpoint serving the calls.
    pub async fn register_service(
        &self,
        service: &str,
        service_api: &str,
    ) -> Result<(), XmlRpcError> {
        self.call(
            "registerService",
            vec![
                XmlRpcValue::string(service),
                XmlRpcValue::string(service_api),
                XmlRpcValue::string(&self.caller_api),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn unregister_service(
        &self,
        service: &str,
        service_api: &str,
    ) -> Result<i32, XmlRpcError> {
        self.call(
            "unregisterService",
            vec![
                XmlRpcValue::string(service),
                XmlRpcValue::string(service_api),
            ],
        )
        .await?
        .as_int()
    }

    pub async fn lookup_node(&self, node_name: &str) -> Result<String, XmlRpcError> {
        self.call("lookupNode", vec![XmlRpcValue::string(node_name)])
            .await?
            .into_string()
    }

    pub async fn get_published_topics(
        &self,
        subgraph: &str,
    ) -> Result<Vec<(String, String)>, XmlRpcError> {
        let payload = self
            .call("getPublishedTopics", vec![XmlRpcValue::string(subgraph)])
            .await?;
        pair_list(payload)
    }

    pub async fn get_topic_types(&self) -> Result<Vec<(String, String)>, XmlRpcError> {
        let payload = self.call("getTopicTypes", vec![]).await?;
        pair_list(payload)
    }

    pub async fn get_system_state(&self) -> Result<SystemState, XmlRpcError> {
        let mut triple = self.call("getSystemState", vec![]).await?.into_array()?;
        if triple.len() != 3 {
            return Err(XmlRpcError::BadConn(
                "getSystemState did not return three lists".to_owned(),
            ));
        }
        let services = name_group_list(triple.pop().expect("len checked"))?;
        let subscribers = name_group_list(triple.pop().expect("len checked"))?;
        let publishers = name_group_list(triple.pop().expect("len checked"))?;
        Ok(SystemState {
            publishers,
            subscribers,
            services,
        })
    }

    pub async fn get_uri(&self) -> Result<String, XmlRpcError> {
        self.call("getUri", vec![]).await?.into_string()
    }

    /// Resolves a service name to its `rosrpc://host:port` API.
    pub async fn lookup_service(&self, service: &str) -> Result<String, XmlRpcError> {
        self.call("lookupService", vec![XmlRpcValue::string(service)])
            .await?
            .into_string()
    }

    pub async fn delete_param(&self, key: &str) -> Result<(), XmlRpcError> {
        self.call("deleteParam", vec![XmlRpcValue::string(key)])
            .await?;
        Ok(())
    }

    pub async fn set_param(&self, key: &str, value: XmlRpcValue) -> Result<(), XmlRpcError> {
        self.call("setParam", vec![XmlRpcValue::string(key), value])
            .await?;
        Ok(())
    }

    pub async fn get_param(&self, key: &str) -> Result<XmlRpcValue, XmlRpcError> {
        self.call("getParam", vec![XmlRpcValue::string(key)]).await
    }

    pub async fn search_param(&self, key: &str) -> Result<String, XmlRpcError> {
        self.call("searchParam", vec![XmlRpcValue::string(key)])
            .await?
            .into_string()
    }

    /// Subscribes to updates of a parameter; the current value comes back.
    /// Updates arrive through the Slave `paramUpdate` method.
    pub async fn subscribe_param(&self, key: &str) -> Result<XmlRpcValue, XmlRpcError> {
        self.call(
            "subscribeParam",
            vec![
                XmlRpcValue::string(&self.caller_api),
                XmlRpcValue::string(key),
            ],
        )
        .await
    }

    pub async fn unsubscribe_param(&self, key: &str) -> Result<i32, XmlRpcError> {
        self.call(
            "unsubscribeParam",
            vec![
                XmlRpcValue::string(&self.caller_api),
                XmlRpcValue::string(key),
            ],
        )
        .await?
        .as_int()
    }

    pub async fn has_param(&self, key: &str) -> Result<bool, XmlRpcError> {
        self.call("hasParam", vec![XmlRpcValue::string(key)])
            .await?
            .as_bool()
    }

    pub async fn get_param_names(&self) -> Result<Vec<String>, XmlRpcError> {
        let payload = self.call("getParamNames", vec![]).await?;
        string_list(payload)
    }

}

fn string_list(payload: XmlRpcValue) -> Result<Vec<String>, XmlRpcError> {
    payload
        .into_array()?
        .into_iter()
        .map(XmlRpcValue::into_string)
        .collect()
}

fn pair_list(payload: XmlRpcValue) -> Result<Vec<(String, String)>, XmlRpcError> {
    payload
        .into_array()?
        .into_iter()
        .map(|entry| {
            let mut pair = entry.into_array()?;
            if pair.len() != 2 {
                return Err(XmlRpcError::BadConn("expected a [name, type] pair".to_owned()));
            }
            let second = pair.pop().expect("len checked").into_string()?;
            let first = pair.pop().expect("len checked").into_string()?;
            Ok((first, second))
        })
        .collect()
}

fn name_group_list(payload: XmlRpcValue) -> Result<Vec<(String, Vec<String>)>, XmlRpcError> {
    payload
        .into_array()?
        .into_iter()
        .map(|entry| {
            let mut pair = entry.into_array()?;
            if pair.len() != 2 {
                return Err(XmlRpcError::BadConn(
                    "expected a [name, [providers]] pair".to_owned(),
                ));
            }
            let providers = string_list(pair.pop().expect("len checked"))?;
            let name = pair.pop().expect("len checked").into_string()?;
            Ok((name, providers))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xmlrpc::{XmlRpcParser, XmlRpcStreamer};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Serves one canned master response; returns its URI and a channel
    /// carrying the (method, params) the stub saw.
    async fn master_stub(
        response_code: i32,
        status: &str,
        payload: XmlRpcValue,
    ) -> (String, tokio::sync::oneshot::Receiver<(String, Vec<XmlRpcValue>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = status.to_owned();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut parser = XmlRpcParser::new(&mut stream);
            parser.http_request().await.unwrap();
            let call = parser.method_call().await.unwrap();
            parser.drain_body().await.unwrap();
            let _ = seen_tx.send(call);
            let mut streamer = XmlRpcStreamer::new(&mut stream);
            streamer.method_response(response_code, &status, &payload);
            streamer.send_response(200).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        (format!("http://{}:{}", addr.ip(), addr.port()), seen_rx)
    }

    fn client(uri: &str) -> MasterClient {
        MasterClient::new(uri, "/turtlesim", "http://host:11411").unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn register_publisher_lists_subscribers() {
        let payload = XmlRpcValue::Array(vec![XmlRpcValue::string("http://sub1:123")]);
        let (uri, seen) = master_stub(1, "", payload).await;
        let subscribers = client(&uri)
            .register_publisher("/chatter", "std_msgs/String")
            .await
            .unwrap();
        assert_eq!(subscribers, vec!["http://sub1:123".to_owned()]);

        let (method, params) = seen.await.unwrap();
        assert_eq!(method, "registerPublisher");
        assert_eq!(
            params,
            vec![
                XmlRpcValue::string("/turtlesim"),
                XmlRpcValue::string("/chatter"),
                XmlRpcValue::string("std_msgs/String"),
                XmlRpcValue::string("http://host:11411"),
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn failure_code_maps_to_bad_param() {
        let (uri, _seen) = master_stub(0, "no such node", XmlRpcValue::Int(0)).await;
        let result = client(&uri).lookup_node("/ghost").await;
        assert!(matches!(result, Err(XmlRpcError::BadParam(_))));
    }

    #[test_log::test(tokio::test)]
    async fn error_code_maps_to_bad_conn() {
        let (uri, _seen) = master_stub(-1, "broken", XmlRpcValue::Int(0)).await;
        let result = client(&uri).get_pid().await;
        assert!(matches!(result, Err(XmlRpcError::BadConn(_))));
    }

    #[test_log::test(tokio::test)]
    async fn wrong_payload_class_maps_to_bad_conn() {
        let (uri, _seen) = master_stub(1, "", XmlRpcValue::string("not a pid")).await;
        let result = client(&uri).get_pid().await;
        assert!(matches!(result, Err(XmlRpcError::BadConn(_))));
    }

    #[test_log::test(tokio::test)]
    async fn system_state_parses_groups() {
        let group = |name: &str, providers: &[&str]| {
            XmlRpcValue::Array(vec![
                XmlRpcValue::string(name),
                XmlRpcValue::Array(providers.iter().map(|p| XmlRpcValue::string(*p)).collect()),
            ])
        };
        let payload = XmlRpcValue::Array(vec![
            XmlRpcValue::Array(vec![group("/chatter", &["/talker"])]),
            XmlRpcValue::Array(vec![group("/chatter", &["/listener"])]),
            XmlRpcValue::Array(vec![]),
        ]);
        let (uri, _seen) = master_stub(1, "", payload).await;
        let state = client(&uri).get_system_state().await.unwrap();
        assert_eq!(state.publishers[0].0, "/chatter");
        assert_eq!(state.subscribers[0].1, vec!["/listener".to_owned()]);
        assert!(state.services.is_empty());
    }
}
