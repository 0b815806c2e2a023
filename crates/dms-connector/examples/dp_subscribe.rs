//! Datapoint Subscription Example
//!
//! Subscribes to value changes of a datapoint for a while, then
//! unsubscribes.
//!
//! Run with: `DMS_HOST=10.0.0.5 cargo run -p dms-connector --example dp_subscribe`

use std::time::Duration;

use dms_connector::{
    DmsClient, DmsConfig, DmsError, DmsEvent, EventHandler, EventMask, ReconnectPolicy,
    SubscribeCommand,
};
use tracing_subscriber::EnvFilter;

struct PrintHandler;

impl EventHandler for PrintHandler {
    fn on_event(&self, event: &DmsEvent) {
        println!(
            "[{}] {:?} {} = {}",
            event.stamp.as_deref().unwrap_or("-"),
            event.code,
            event.path,
            event.value
        );
    }

    fn on_terminated(&self, error: &DmsError) {
        println!("subscription ended: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let host = std::env::var("DMS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let config = DmsConfig::new("dp-subscribe", "demo")
        .host(host)
        .reconnect(ReconnectPolicy::enabled());
    let client = DmsClient::connect(config).await?;

    let subscription = client
        .subscribe(
            SubscribeCommand::new("System:Time").event(EventMask::ON_CHANGE | EventMask::ON_SET),
            PrintHandler,
        )
        .await?;
    println!("subscribed as {}", subscription.id());

    tokio::time::sleep(Duration::from_secs(30)).await;

    subscription.unsubscribe().await?;
    client.close().await?;
    Ok(())
}
