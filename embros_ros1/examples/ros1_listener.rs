use embros_common::RosMessageType;
use embros_ros1::NodeHandle;

#[derive(serde::Serialize, serde::Deserialize, Debug, Default, Clone)]
struct StdString {
    data: String,
}

impl RosMessageType for StdString {
    const ROS_TYPE_NAME: &'static str = "std_msgs/String";
    const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";
    const DEFINITION: &'static str = "string data";
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    {
        let nh = NodeHandle::new("http://localhost:11311", "listener_rs").await?;
        let mut subscriber = nh.subscribe::<StdString>("/chatter", 1).await?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::warn!("ctrl-c, exiting");
                    break;
                }
                msg = subscriber.next() => {
                    if let Some(Ok(msg)) = msg {
                        log::info!("[/listener_rs] Got message: {}", msg.data);
                    }
                }
            }
        }
    }
    log::info!("done with subscribing, letting subscription unregister");
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    Ok(())
}
