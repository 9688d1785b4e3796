//! End-to-end node tests against an in-process Master stub.
//!
//! The stub speaks just enough of the Master API for a node to register,
//! discover peers and be shut down; it is built from the crate's own XMLRPC
//! parser and streamer, so these tests also exercise both sides of the wire
//! format.

use embros_common::{RosMessageType, RosServiceType};
use embros_ros1::names::split_rosrpc_uri;
use embros_ros1::tcpros::{self, ConnectionHeader, TcpRosError};
use embros_ros1::xmlrpc::{self, XmlRpcParser, XmlRpcStreamer, XmlRpcValue};
use embros_ros1::{NodeConfig, NodeHandle, NodeState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

const CHATTER_MD5: &str = "992ce8a1687cec8c8bd883ec73ca41d1";

#[derive(serde::Serialize, serde::Deserialize, Debug, Default, Clone, PartialEq)]
struct Chatter {
    data: String,
}

impl RosMessageType for Chatter {
    const ROS_TYPE_NAME: &'static str = "std_msgs/String";
    const MD5SUM: &'static str = CHATTER_MD5;
    const DEFINITION: &'static str = "string data";
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Default, Clone)]
struct AddTwoIntsRequest {
    a: i64,
    b: i64,
}

impl RosMessageType for AddTwoIntsRequest {
    const ROS_TYPE_NAME: &'static str = "rospy_tutorials/AddTwoIntsRequest";
    const MD5SUM: &'static str = "36d09b846be0b371c5f190354dd3153e";
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Default, Clone)]
struct AddTwoIntsResponse {
    sum: i64,
}

impl RosMessageType for AddTwoIntsResponse {
    const ROS_TYPE_NAME: &'static str = "rospy_tutorials/AddTwoIntsResponse";
    const MD5SUM: &'static str = "b88405221c77b1878a3cbbfff53428d7";
}

struct AddTwoInts;

impl RosServiceType for AddTwoInts {
    const ROS_SERVICE_NAME: &'static str = "rospy_tutorials/AddTwoInts";
    const MD5SUM: &'static str = "6a2e34150c00229791cc89ff309fff21";
    type Request = AddTwoIntsRequest;
    type Response = AddTwoIntsResponse;
}

#[derive(Default)]
struct MasterState {
    calls: Vec<(String, Vec<XmlRpcValue>)>,
    /// topic -> XMLRPC URIs of its registered publishers
    publishers: HashMap<String, Vec<String>>,
    /// service -> rosrpc URI of its provider
    services: HashMap<String, String>,
}

impl MasterState {
    fn saw(&self, method: &str) -> Option<&Vec<XmlRpcValue>> {
        self.calls
            .iter()
            .find(|(name, _)| name == method)
            .map(|(_, params)| params)
    }
}

fn param_str(params: &[XmlRpcValue], index: usize) -> String {
    params
        .get(index)
        .and_then(|value| value.as_str().ok())
        .unwrap_or_default()
        .to_owned()
}

async fn serve_master_request(stream: &mut TcpStream, state: Arc<Mutex<MasterState>>) {
    let (read_half, write_half) = stream.split();
    let mut parser = XmlRpcParser::new(read_half);
    if parser.http_request().await.is_err() {
        return;
    }
    let Ok((method, params)) = parser.method_call().await else {
        return;
    };
    let _ = parser.drain_body().await;

    let payload = {
        let mut master = state.lock().await;
        let payload = match method.as_str() {
            "getPid" => XmlRpcValue::Int(4242),
            "registerPublisher" => {
                let topic = param_str(&params, 1);
                let api = param_str(&params, 3);
                let apis = master.publishers.entry(topic).or_default();
                if !apis.contains(&api) {
                    apis.push(api);
                }
                XmlRpcValue::Array(vec![])
            }
            "registerSubscriber" => {
                let topic = param_str(&params, 1);
                XmlRpcValue::Array(
                    master
                        .publishers
                        .get(&topic)
                        .map(|apis| apis.iter().map(|api| XmlRpcValue::string(api)).collect())
                        .unwrap_or_default(),
                )
            }
            "registerService" => {
                let service = param_str(&params, 1);
                let api = param_str(&params, 2);
                master.services.insert(service, api);
                XmlRpcValue::Int(1)
            }
            "lookupService" => {
                let service = param_str(&params, 1);
                match master.services.get(&service) {
                    Some(api) => XmlRpcValue::string(api),
                    None => XmlRpcValue::Int(0),
                }
            }
            "subscribeParam" => XmlRpcValue::Int(99),
            _ => XmlRpcValue::Int(1),
        };
        master.calls.push((method, params));
        payload
    };

    let mut streamer = XmlRpcStreamer::new(write_half);
    streamer.method_response(1, "", &payload);
    let _ = streamer.send_response(200).await;
}

async fn spawn_master() -> (String, Arc<Mutex<MasterState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let state = Arc::new(Mutex::new(MasterState::default()));
    let state_copy = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let state = state_copy.clone();
            tokio::spawn(async move {
                serve_master_request(&mut stream, state).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (uri, state)
}

/// A node bound to loopback so the advertised URIs resolve in tests. The
/// legacy fixed-width Content-Length framing is on, so every exchange with
/// the stub also exercises the interop path.
async fn node(master_uri: &str, name: &str) -> NodeHandle {
    let mut config = NodeConfig::new(master_uri, name).unwrap();
    config.hostname = "127.0.0.1".to_owned();
    config.xmlrpc_addr = "127.0.0.1:0".parse().unwrap();
    config.tcpros_addr = "127.0.0.1:0".parse().unwrap();
    config.fixed_content_length = true;
    NodeHandle::with_config(config).await.unwrap()
}

async fn wait_for_running(handle: &NodeHandle) {
    timeout(Duration::from_secs(10), async {
        loop {
            if handle.state().await.unwrap() == NodeState::Running {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node never reached RUNNING");
}

#[test_log::test(tokio::test)]
async fn registration_sequence_and_slave_introspection() {
    let (master_uri, state) = spawn_master().await;
    let handle = node(&master_uri, "/turtlesim").await;
    let _publisher = handle
        .advertise::<Chatter>("/chatter", 4, false)
        .await
        .unwrap();
    wait_for_running(&handle).await;

    // The node registered its publication with the Master, with the caller
    // id first and its advertised API last.
    let params = timeout(Duration::from_secs(10), async {
        loop {
            if let Some(params) = state.lock().await.saw("registerPublisher").cloned() {
                return params;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("registerPublisher never reached the master");
    assert_eq!(param_str(&params, 0), "/turtlesim");
    assert_eq!(param_str(&params, 1), "/chatter");
    assert_eq!(param_str(&params, 2), "std_msgs/String");
    assert_eq!(param_str(&params, 3), handle.xmlrpc_uri());

    // getPublications through our own Slave API lists the topic.
    let (code, _, payload) = xmlrpc::call_method(
        handle.xmlrpc_uri(),
        "getPublications",
        &[XmlRpcValue::string("/tester")],
    )
    .await
    .unwrap();
    assert_eq!(code, 1);
    let pairs = payload.into_array().unwrap();
    assert!(pairs.iter().any(|pair| {
        pair.as_array()
            .map(|fields| {
                fields[0] == XmlRpcValue::string("/chatter")
                    && fields[1] == XmlRpcValue::string("std_msgs/String")
            })
            .unwrap_or(false)
    }));

    // getPid reports this process.
    let (code, _, payload) = xmlrpc::call_method(
        handle.xmlrpc_uri(),
        "getPid",
        &[XmlRpcValue::string("/tester")],
    )
    .await
    .unwrap();
    assert_eq!(code, 1);
    assert_eq!(payload, XmlRpcValue::Int(std::process::id() as i32));

    // requestTopic resolves the advertised topic to the TCPROS endpoint...
    let protocols = XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::string(
        "TCPROS",
    )])]);
    let (code, _, payload) = xmlrpc::call_method(
        handle.xmlrpc_uri(),
        "requestTopic",
        &[
            XmlRpcValue::string("/tester"),
            XmlRpcValue::string("/chatter"),
            protocols.clone(),
        ],
    )
    .await
    .unwrap();
    assert_eq!(code, 1);
    let triple = payload.into_array().unwrap();
    assert_eq!(triple[0], XmlRpcValue::string("TCPROS"));

    // ...and stops resolving it the moment it is unadvertised.
    handle.unadvertise("/chatter").await.unwrap();
    let (code, _, _) = xmlrpc::call_method(
        handle.xmlrpc_uri(),
        "requestTopic",
        &[
            XmlRpcValue::string("/tester"),
            XmlRpcValue::string("/chatter"),
            protocols,
        ],
    )
    .await
    .unwrap();
    assert_eq!(code, -1);
}

#[test_log::test(tokio::test)]
async fn messages_flow_from_publisher_to_subscriber() {
    let (master_uri, _state) = spawn_master().await;
    let talker = node(&master_uri, "/talker").await;
    let publisher = talker
        .advertise::<Chatter>("/chatter", 8, false)
        .await
        .unwrap();
    wait_for_running(&talker).await;

    let listener = node(&master_uri, "/listener").await;
    let mut subscriber = listener.subscribe::<Chatter>("/chatter", 8).await.unwrap();
    wait_for_running(&listener).await;

    let received = timeout(Duration::from_secs(15), async {
        loop {
            publisher
                .publish(&Chatter {
                    data: "hello".to_owned(),
                })
                .await
                .unwrap();
            match timeout(Duration::from_millis(300), subscriber.next()).await {
                Ok(Some(Ok(message))) => return message,
                _ => continue,
            }
        }
    })
    .await
    .expect("no message made it through");
    assert_eq!(received.data, "hello");
}

#[test_log::test(tokio::test)]
async fn handshake_answers_mismatches_with_an_error_header() {
    let (master_uri, _state) = spawn_master().await;
    let talker = node(&master_uri, "/talker").await;
    let _publisher = talker
        .advertise::<Chatter>("/chatter", 4, false)
        .await
        .unwrap();
    wait_for_running(&talker).await;
    let (host, port) = split_rosrpc_uri(talker.tcpros_uri()).unwrap();

    // One character off in the md5sum: the publisher answers with an
    // error-only header and closes.
    let mut stream = TcpStream::connect((host.as_str(), port)).await.unwrap();
    let mut header = ConnectionHeader {
        caller_id: "/pub".to_owned(),
        topic: Some("/chatter".to_owned()),
        topic_type: "std_msgs/String".to_owned(),
        md5sum: Some("992ce8a1687cec8c8bd883ec73ca41d2".to_owned()),
        ..Default::default()
    };
    stream
        .write_all(&header.to_bytes(true).unwrap())
        .await
        .unwrap();
    let reply = tcpros::receive_header(&mut stream, true).await;
    assert!(matches!(reply, Err(TcpRosError::Remote(_))));

    // The matching handshake binds and is answered with the publisher's
    // own header.
    let mut stream = TcpStream::connect((host.as_str(), port)).await.unwrap();
    header.md5sum = Some(CHATTER_MD5.to_owned());
    stream
        .write_all(&header.to_bytes(true).unwrap())
        .await
        .unwrap();
    let reply = tcpros::receive_header(&mut stream, true).await.unwrap();
    assert_eq!(reply.caller_id, "/talker");
    assert_eq!(reply.md5sum.as_deref(), Some(CHATTER_MD5));
    assert_eq!(reply.topic_type, "std_msgs/String");
    assert!(!reply.latching);
}

#[test_log::test(tokio::test)]
async fn service_calls_round_trip() {
    let (master_uri, state) = spawn_master().await;
    let adder = node(&master_uri, "/adder").await;
    let _server = adder
        .advertise_service::<AddTwoInts, _>(
            "/add_two_ints",
            |request: AddTwoIntsRequest| -> Result<
                AddTwoIntsResponse,
                Box<dyn std::error::Error + Send + Sync>,
            > {
                Ok(AddTwoIntsResponse {
                    sum: request.a + request.b,
                })
            },
        )
        .await
        .unwrap();
    wait_for_running(&adder).await;
    timeout(Duration::from_secs(10), async {
        loop {
            if state.lock().await.services.contains_key("/add_two_ints") {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("service never registered");

    let caller = node(&master_uri, "/caller").await;
    let client = caller
        .service_client::<AddTwoInts>("/add_two_ints", false)
        .unwrap();
    let response = timeout(
        Duration::from_secs(10),
        client.call(&AddTwoIntsRequest { a: 2, b: 40 }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.sum, 42);

    // Persistent clients reuse their connection across calls.
    let persistent = caller
        .service_client::<AddTwoInts>("/add_two_ints", true)
        .unwrap();
    for (a, b, sum) in [(1, 1, 2), (20, 3, 23), (-5, 5, 0)] {
        let response = timeout(
            Duration::from_secs(10),
            persistent.call(&AddTwoIntsRequest { a, b }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(response.sum, sum);
    }
}

#[test_log::test(tokio::test)]
async fn shutdown_by_master_unregisters_and_goes_idle() {
    let (master_uri, state) = spawn_master().await;
    let handle = node(&master_uri, "/turtlesim").await;
    let _publisher = handle
        .advertise::<Chatter>("/chatter", 4, false)
        .await
        .unwrap();
    wait_for_running(&handle).await;

    let mut shutdown_rx = handle.shutdown_channel();
    let (code, _, _) = xmlrpc::call_method(
        handle.xmlrpc_uri(),
        "shutdown",
        &[
            XmlRpcValue::string("/master"),
            XmlRpcValue::string("testing"),
        ],
    )
    .await
    .unwrap();
    assert_eq!(code, 1);

    timeout(Duration::from_secs(5), shutdown_rx.changed())
        .await
        .expect("no shutdown notification")
        .unwrap();
    assert_eq!((*shutdown_rx.borrow()).as_deref(), Some("testing"));

    // The sweep unregistered the publication with the Master.
    timeout(Duration::from_secs(5), async {
        loop {
            if state.lock().await.saw("unregisterPublisher").is_some() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("unregisterPublisher never reached the master");

    // The actor is gone; handle queries fail from here on.
    timeout(Duration::from_secs(5), async {
        loop {
            if handle.state().await.is_err() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node never went idle");
}

#[test_log::test(tokio::test)]
async fn param_updates_reach_their_subscription() {
    let (master_uri, _state) = spawn_master().await;
    let handle = node(&master_uri, "/paramnode").await;
    wait_for_running(&handle).await;

    let mut subscription = handle.subscribe_param("~gain").await.unwrap();
    assert_eq!(subscription.key(), "/paramnode/gain");
    assert_eq!(subscription.initial(), Some(&XmlRpcValue::Int(99)));

    // The Master pushes an update (note the trailing slash it appends).
    let (code, _, _) = xmlrpc::call_method(
        handle.xmlrpc_uri(),
        "paramUpdate",
        &[
            XmlRpcValue::string("/master"),
            XmlRpcValue::string("/paramnode/gain/"),
            XmlRpcValue::Int(123),
        ],
    )
    .await
    .unwrap();
    assert_eq!(code, 1);
    let update = timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("no param update arrived")
        .unwrap();
    assert_eq!(update, XmlRpcValue::Int(123));

    // An update for a key nobody subscribed to is reported as a failure.
    let (code, _, _) = xmlrpc::call_method(
        handle.xmlrpc_uri(),
        "paramUpdate",
        &[
            XmlRpcValue::string("/master"),
            XmlRpcValue::string("/nobody/cares"),
            XmlRpcValue::Int(7),
        ],
    )
    .await
    .unwrap();
    assert_eq!(code, 0);
}
