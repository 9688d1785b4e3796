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

    let nh = NodeHandle::new("http://localhost:11311", "talker_rs").await?;
    let publisher = nh.advertise::<StdString>("/chatter", 1, false).await?;

    let mut count = 0u32;
    loop {
        publisher
            .publish(&StdString {
                data: format!("hello world {count}"),
            })
            .await?;
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        count += 1;
    }
}
