//! # DMS Connector
//!
//! Client for the DMS JSON Data Exchange protocol, spoken over a single
//! websocket connection to a building-management data server.
//!
//! ## Features
//!
//! - **Typed Commands**: get, set, rename, delete, subscribe, unsubscribe and
//!   the changelog commands, with their options, as Rust types
//! - **Multiplexing**: many concurrent requests over one connection,
//!   correlated by tag
//! - **Events**: subscription events delivered to handlers on a background
//!   worker, in arrival order
//! - **Connection Lifecycle**: keep-alive, explicit close and reconnect, and
//!   optional automatic reconnect with exponential backoff
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dms_connector::{DmsClient, DmsConfig, Query};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DmsConfig::new("my-tool", "operator").host("10.0.0.5");
//!     let client = DmsClient::connect(config).await?;
//!
//!     client.set("Plant:Setpoint", 21.5).await?;
//!     let found = client
//!         .search("Plant", Query::new().reg_ex_path("Temp.*").max_depth(-1))
//!         .await?;
//!     println!("{} datapoints", found.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod messages;
pub mod reconnect;
pub mod websocket;

pub use error::{DmsError, DmsResult};
pub use messages::{
    ChangelogEntries, ChangelogRange, ChangelogReadCommand, Command, CommandKind, DeleteCommand,
    DmsEvent, EventCode, EventMask, ExtInfo, GetCommand, GetResponse, HistData, HistDataSeries,
    HistFormat, Query, RenameCommand, ResponseBody, ResponseCode, ResponsePayload, SetCommand,
    SubscribeCommand, UnsubscribeCommand, ValueType,
};
pub use reconnect::ReconnectPolicy;
pub use websocket::{
    ConnectionState, ConnectionStatus, DmsClient, DmsConfig, EventHandler, Generation,
    MemoryConnector, MemoryPeer, MemoryServer, Subscription, SubscriptionId, SubscriptionStatus,
    Tag,
};
