//! Datapoint Read/Write Example
//!
//! Reads, writes and searches datapoints on a DMS.
//!
//! Run with: `DMS_HOST=10.0.0.5 cargo run -p dms-connector --example dp_read_write`

use dms_connector::{DmsClient, DmsConfig, HistData, HistFormat, Query, SetCommand, ValueType};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let host = std::env::var("DMS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let client = DmsClient::connect(DmsConfig::new("dp-read-write", "demo").host(host)).await?;

    let time = client.get("System:Time").await?;
    println!("System:Time = {}", time.value);

    client
        .set_with(
            SetCommand::new("Demo:Setpoint", 21.5)
                .create(true)
                .value_type(ValueType::Double),
        )
        .await?;
    let renamed = client.rename("Demo:Setpoint", "Demo:Target").await?;
    println!("renamed to {:?}", renamed.new_path);

    let found = client
        .search("System", Query::new().reg_ex_path(".*Time.*").max_depth(-1))
        .await?;
    for dp in &found {
        println!("{:<40} {}", dp.path.as_deref().unwrap_or("?"), dp.value);
    }

    let trend = client
        .trend(
            "Demo:Target",
            HistData::new("2024-01-01T00:00:00,000+01:00").format(HistFormat::Detail),
        )
        .await?;
    println!("{} trend samples", trend.len());

    let deleted = client.delete("Demo:Target", false).await?;
    println!("deleted {} datapoint(s)", deleted.len());

    client.close().await?;
    Ok(())
}
