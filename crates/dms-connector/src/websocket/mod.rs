//! Websocket protocol engine for DMS JSON Data Exchange.
//!
//! This module multiplexes typed commands and event subscriptions over one
//! websocket connection:
//!
//! - **Request-Response Pattern**: every command carries a unique tag; the
//!   response with the same tag resolves the waiting caller, with a local
//!   timeout
//! - **Subscription Pattern**: events carry the tag of their subscribe
//!   command and are handed to the registered [`EventHandler`] on a
//!   background worker
//! - **Generations**: every (re)connect is a new generation; nothing from an
//!   older generation is reused
//! - **Lock-Free Concurrency**: pending requests and subscriptions live in
//!   `scc::HashMap`s
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │  DmsClient  │────▶│ connection task  │────▶│     DMS      │
//! │  (Clone)    │     │  (Background)    │     │   Server     │
//! └─────────────┘     └───────┬──────────┘     └──────────────┘
//!                             │
//!          ┌──────────────────┴────────────────────┐
//!          ▼                                       ▼
//! ┌─────────────────────┐             ┌────────────────────────┐
//! │    PendingTable     │             │  SubscriptionRegistry  │
//! │   (scc::HashMap)    │             │ (scc::HashMap) ──▶ EventDispatcher
//! └─────────────────────┘             └────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dms_connector::{DmsClient, DmsConfig, DmsEvent, SubscribeCommand};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DmsClient::connect(DmsConfig::new("my-tool", "operator")).await?;
//!
//!     let value = client.get("System:Time").await?;
//!     println!("{:?}", value.value);
//!
//!     let subscription = client
//!         .subscribe(SubscribeCommand::new("System:Time"), |event: &DmsEvent| {
//!             println!("{} -> {}", event.path, event.value);
//!         })
//!         .await?;
//!
//!     subscription.unsubscribe().await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `host` / `port` | 127.0.0.1 / 9020 | DMS endpoint |
//! | `request_timeout` | 300s | Default request-response timeout |
//! | `ping_interval` | 30s | Interval between websocket pings |
//! | `pong_timeout` | 10s | Max wait for pong response |
//! | `reconnect` | disabled | Backoff policy after a lost connection |
//! | `max_pending_requests` | 1000 | Maximum concurrent pending requests |
//! | `callback_duration_warning` | 10s | Slow handler warning threshold |
//! | `event_queue_warn_size` | 100 | Event backlog warning threshold |

mod client;
mod codec;
mod config;
mod connection;
mod dispatcher;
mod pending;
mod subscription;
mod transport;
mod types;

pub use client::{DmsClient, Subscription};
pub use codec::{DmsCodec, Inbound};
pub use config::{DEFAULT_BASE_PATH, DEFAULT_HOST, DEFAULT_PORT, DmsConfig};
pub use dispatcher::{EventDispatcher, EventHandler};
pub use pending::{PendingTable, PendingWaiter};
pub use subscription::{SubscriptionId, SubscriptionRegistry, SubscriptionStatus};
pub use transport::{
    Connector, FrameStream, MemoryConnector, MemoryPeer, MemoryServer, TungsteniteConnector,
    TungsteniteWriter, WsFrame, WsWriter, tungstenite_frames,
};
pub use types::{ConnectionState, ConnectionStatus, Generation, Tag};
