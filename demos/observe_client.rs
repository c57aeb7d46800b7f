use std::net::SocketAddr;
use std::time::Duration;

use coap_engine::{ClientConfig, CoapClient, UdpTransport};
use log::info;
use tokio::time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let server: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5683".to_string())
        .parse()?;

    let client = CoapClient::bind(UdpTransport::new("0.0.0.0:0"), ClientConfig::default()).await?;
    if !client.ping(server).await? {
        anyhow::bail!("{server} did not answer the ping");
    }

    if let Some(links) = client.get(server, ".well-known/core").await? {
        info!("Resources: {}", String::from_utf8_lossy(&links.payload));
    }

    let token = client
        .observe(server, "uptime", |notification| match notification {
            Some(message) => info!(
                "Observe={:?}: {}",
                message.get_observe_value(),
                String::from_utf8_lossy(&message.payload)
            ),
            None => info!("Observation ended"),
        })
        .await?;

    time::sleep(Duration::from_secs(30)).await;
    client.cancel_observing(&token, server, true).await?;
    client.stop().await;
    Ok(())
}
