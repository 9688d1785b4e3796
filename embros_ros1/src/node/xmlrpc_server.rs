//! The Slave XMLRPC server every ROS node exposes to its peers and to the
//! Master.
//!
//! One request per connection: parse the HTTP POST and the `methodCall`
//! envelope, dispatch against the node actor, answer with the standard
//! `[code, statusMessage, payload]` triple. `shutdown` is special-cased so
//! its reply goes out before the node observes the exit flag.

use super::actor::NodeServerHandle;
use crate::pool::WorkerPool;
use crate::xmlrpc::{code, XmlRpcError, XmlRpcParser, XmlRpcStreamer, XmlRpcValue};
use crate::XMLRPC_TIMEOUT;
use log::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

pub(crate) async fn run(
    listener: TcpListener,
    handle: NodeServerHandle,
    pool: WorkerPool,
    mut node_exit: watch::Receiver<bool>,
    fixed_length: bool,
) {
    debug!("Slave XMLRPC server running");
    loop {
        tokio::select! {
            _ = node_exit.changed() => {
                if *node_exit.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("XMLRPC accept failed: {err}");
                        continue;
                    }
                };
                trace!("Slave request from {peer}");
                let Some(permit) = pool.try_admit() else {
                    drop(stream);
                    continue;
                };
                let handle = handle.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    match timeout(XMLRPC_TIMEOUT, serve_request(&mut stream, &handle, fixed_length))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => debug!("Slave request from {peer} failed: {err}"),
                        Err(_) => debug!("Slave request from {peer} timed out"),
                    }
                    drop(permit);
                });
            }
        }
    }
    debug!("Slave XMLRPC server exited");
}

async fn serve_request(
    stream: &mut TcpStream,
    handle: &NodeServerHandle,
    fixed_length: bool,
) -> Result<(), XmlRpcError> {
    let (read_half, write_half) = stream.split();

    let mut parser = XmlRpcParser::new(read_half);
    parser.http_request().await?;
    let (method, params) = parser.method_call().await?;
    parser.drain_body().await?;

    let reply = dispatch(&method, params, handle).await;
    let mut streamer = XmlRpcStreamer::new(write_half).fixed_content_length(fixed_length);
    streamer.method_response(reply.code, &reply.status, &reply.payload);
    streamer.send_response(200).await?;

    // The shutdown request is acknowledged on the wire before the node
    // reacts to it.
    if let Some(reason) = reply.shutdown {
        info!("Shutdown requested over the Slave API: {reason:?}");
        let _ = handle.shutdown(reason);
    }
    Ok(())
}

struct Reply {
    code: i32,
    status: String,
    payload: XmlRpcValue,
    shutdown: Option<String>,
}

impl Reply {
    fn ok(payload: XmlRpcValue) -> Self {
        Self {
            code: code::SUCCESS,
            status: String::new(),
            payload,
            shutdown: None,
        }
    }

    fn failure(status: impl Into<String>) -> Self {
        Self {
            code: code::FAILURE,
            status: status.into(),
            payload: XmlRpcValue::Int(0),
            shutdown: None,
        }
    }

    fn error(status: impl Into<String>) -> Self {
        Self {
            code: code::ERROR,
            status: status.into(),
            payload: XmlRpcValue::Int(0),
            shutdown: None,
        }
    }
}

/// Dispatches one Slave method against the node actor.
async fn dispatch(method: &str, params: Vec<XmlRpcValue>, handle: &NodeServerHandle) -> Reply {
    match dispatch_inner(method, params, handle).await {
        Ok(reply) => reply,
        Err(err) => Reply::error(format!("{method}: {err}")),
    }
}

async fn dispatch_inner(
    method: &str,
    mut params: Vec<XmlRpcValue>,
    handle: &NodeServerHandle,
) -> Result<Reply, embros_common::Error> {
    // caller_id is always the first parameter; none of the handlers below
    // key off it, but a call without one is malformed.
    if params.is_empty() {
        return Err(embros_common::Error::BadParam("missing caller_id".to_owned()));
    }

    match method {
        "getBusStats" => Ok(Reply::ok(XmlRpcValue::Array(vec![
            XmlRpcValue::Array(vec![]),
            XmlRpcValue::Array(vec![]),
            XmlRpcValue::Array(vec![]),
        ]))),
        "getBusInfo" => Ok(Reply::ok(XmlRpcValue::Array(vec![]))),
        "getMasterUri" => {
            let uri = handle.get_master_uri().await.unwrap_or_default();
            Ok(Reply::ok(XmlRpcValue::String(uri)))
        }
        "getPid" => {
            let pid = handle.get_pid().await.unwrap_or(-1);
            Ok(Reply::ok(XmlRpcValue::Int(pid)))
        }
        "getPublications" => {
            let pairs = handle.get_publications().await.unwrap_or_default();
            Ok(Reply::ok(pair_array(pairs)))
        }
        "getSubscriptions" => {
            let pairs = handle.get_subscriptions().await.unwrap_or_default();
            Ok(Reply::ok(pair_array(pairs)))
        }
        "paramUpdate" => {
            if params.len() != 3 {
                return Err(embros_common::Error::BadParam(
                    "expected [caller_id, key, value]".to_owned(),
                ));
            }
            let value = params.pop().expect("len checked");
            let key = params.pop().expect("len checked").into_string()?;
            let key = key.trim_end_matches('/').to_owned();
            match handle.param_update(key.clone(), value).await {
                Ok(true) => Ok(Reply::ok(XmlRpcValue::Int(0))),
                Ok(false) => Ok(Reply::failure(format!("not subscribed to {key}"))),
                Err(err) => Err(err),
            }
        }
        "publisherUpdate" => {
            if params.len() != 3 {
                return Err(embros_common::Error::BadParam(
                    "expected [caller_id, topic, publishers]".to_owned(),
                ));
            }
            let publishers = params
                .pop()
                .expect("len checked")
                .into_array()?
                .into_iter()
                .map(XmlRpcValue::into_string)
                .collect::<Result<Vec<_>, _>>()?;
            let topic = params.pop().expect("len checked").into_string()?;
            handle.publisher_update(topic, publishers).await?;
            Ok(Reply::ok(XmlRpcValue::Int(0)))
        }
        "requestTopic" => {
            if params.len() != 3 {
                return Err(embros_common::Error::BadParam(
                    "expected [caller_id, topic, protocols]".to_owned(),
                ));
            }
            let protocols = params.pop().expect("len checked").into_array()?;
            let topic = params.pop().expect("len checked").into_string()?;
            let wants_tcpros = protocols.iter().any(|entry| {
                entry
                    .as_array()
                    .ok()
                    .and_then(|fields| fields.first())
                    .and_then(|name| name.as_str().ok())
                    .map(|name| name == "TCPROS")
                    .unwrap_or(false)
            });
            if !wants_tcpros {
                return Ok(Reply::failure("no supported protocol requested"));
            }
            match handle.request_topic(topic.clone()).await? {
                Some((host, port)) => Ok(Reply::ok(XmlRpcValue::Array(vec![
                    XmlRpcValue::string("TCPROS"),
                    XmlRpcValue::String(host),
                    XmlRpcValue::Int(i32::from(port)),
                ]))),
                None => Ok(Reply::error(format!("not a publisher of {topic}"))),
            }
        }
        "shutdown" => {
            let reason = if params.len() > 1 {
                params.remove(1).into_string().unwrap_or_default()
            } else {
                String::new()
            };
            Ok(Reply {
                code: code::SUCCESS,
                status: String::new(),
                payload: XmlRpcValue::Int(0),
                shutdown: Some(reason),
            })
        }
        other => Ok(Reply::error(format!("unknown method {other:?}"))),
    }
}

fn pair_array(pairs: Vec<(String, String)>) -> XmlRpcValue {
    XmlRpcValue::Array(
        pairs
            .into_iter()
            .map(|(name, kind)| {
                XmlRpcValue::Array(vec![XmlRpcValue::String(name), XmlRpcValue::String(kind)])
            })
            .collect(),
    )
}
