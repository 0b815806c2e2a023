//! The public DMS client.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tracing::{debug, warn};

use super::{
    config::DmsConfig,
    connection::{ControlCommand, DataCommand, Shared, connection_driver},
    dispatcher::EventHandler,
    pending::PendingTable,
    subscription::{SubscriptionId, SubscriptionRegistry, SubscriptionState, SubscriptionStatus},
    transport::{Connector, TungsteniteConnector},
    types::{ConnectionState, ConnectionStatus, Generation, Tag},
};
use crate::{
    error::{DmsError, DmsResult},
    messages::{
        ChangelogEntries, ChangelogGroupsResponse, ChangelogRange, ChangelogReadCommand,
        ChangelogReadResponse, Command, DeleteCommand, DeleteResponse, EventMask, GetCommand,
        GetResponse, HistData, HistDataSeries, Query, RenameCommand, RenameResponse,
        ResponsePayload, SetCommand, SetResponse, SubscribeCommand, SubscriptionResponse,
        UnsubscribeCommand,
    },
};

const FRESH_TAG_ATTEMPTS: usize = 3;

struct ClientInner {
    shared: Arc<Shared>,
    ctrl_tx: mpsc::Sender<ControlCommand>,
    cmd_tx: mpsc::Sender<DataCommand>,
}

/// Cancels a request registration when the caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    tag: Tag,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.cancel_registration(&self.tag, self.seq) {
            debug!(tag = %self.tag, "Cancelled abandoned request");
        }
    }
}

/// Removes a staged subscription unless the subscribe succeeded.
struct StagedSubscription<'a> {
    registry: &'a SubscriptionRegistry,
    tag: Tag,
    armed: bool,
}

impl Drop for StagedSubscription<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.remove(&self.tag);
        }
    }
}

impl ClientInner {
    fn connected_generation(&self) -> DmsResult<Generation> {
        let status = self.shared.status();
        if !status.state.is_connected() {
            return Err(DmsError::NotConnected {
                state: status.state,
            });
        }
        Ok(status.generation)
    }

    async fn request(
        &self,
        command: &Command,
        tag: Option<Tag>,
        generation: Generation,
        timeout_override: Option<Duration>,
    ) -> DmsResult<ResponsePayload> {
        let shared = &self.shared;
        let kind = command.kind();

        let (frame, waiter) = match tag {
            Some(tag) => {
                let frame = shared.codec.encode(command, &tag)?;
                (frame, shared.pending.register(tag, kind, generation)?)
            }
            None => {
                let mut attempt = 0;
                loop {
                    let tag = Tag::new();
                    let frame = shared.codec.encode(command, &tag)?;
                    match shared.pending.register(tag, kind, generation) {
                        Ok(waiter) => break (frame, waiter),
                        Err(DmsError::DuplicateTag { tag }) if attempt + 1 < FRESH_TAG_ATTEMPTS => {
                            debug!(tag = %tag, "Tag collision, generating a new one");
                            attempt += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        };

        let tag = waiter.tag().clone();
        let _guard = PendingGuard {
            pending: &shared.pending,
            tag: tag.clone(),
            seq: waiter.seq(),
        };

        let timeout_duration = timeout_override.unwrap_or(shared.config.request_timeout);
        let exchange = async {
            self.cmd_tx
                .send(DataCommand::Request {
                    frame,
                    tag: tag.clone(),
                    generation,
                })
                .await
                .map_err(|_| DmsError::connection_lost("connection task shut down"))?;
            waiter.wait().await
        };

        match timeout(timeout_duration, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(tag = %tag, kind = %kind, "Request timed out");
                Err(DmsError::request_timeout(timeout_duration, tag.to_string()))
            }
        }
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> DmsResult<()> {
        let Some((path, state)) = self
            .shared
            .registry
            .begin_unsubscribe(&id.tag, id.generation)
        else {
            let status = self.shared.status();
            if status.generation != id.generation || !status.state.is_connected() {
                return Err(DmsError::connection_lost(format!(
                    "subscription {id} belongs to a closed connection"
                )));
            }
            return Ok(());
        };

        let command = Command::from(UnsubscribeCommand::new(path.clone()));
        let result = match self.connected_generation() {
            Ok(generation) if generation == id.generation => self
                .request(&command, Some(id.tag.clone()), generation, None)
                .await
                .map(|_| ()),
            Ok(_) => Err(DmsError::connection_lost(format!(
                "subscription {id} belongs to a closed connection"
            ))),
            Err(err) => Err(err),
        };
        state.set(SubscriptionStatus::Cancelled);

        if let Err(err) = &result {
            warn!(subscription = %id, path = %path, error = %err, "Unsubscribe failed");
        }
        result
    }
}

/// Client for one DMS JSON Data Exchange connection.
///
/// Cloning is cheap; clones share the connection. The connection task
/// stops when the last clone is dropped.
#[derive(Clone)]
pub struct DmsClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for DmsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmsClient")
            .field("url", &self.inner.shared.config.url())
            .field("status", &self.status())
            .finish()
    }
}

impl DmsClient {
    /// Connect to the DMS described by `config`.
    pub async fn connect(config: DmsConfig) -> DmsResult<Self> {
        Self::connect_with(config, TungsteniteConnector).await
    }

    /// Connect through a custom [`Connector`].
    pub async fn connect_with<C: Connector>(config: DmsConfig, connector: C) -> DmsResult<Self> {
        config.validate().map_err(DmsError::config)?;

        let shared = Arc::new(Shared::new(config));
        let capacity = shared.config.command_channel_capacity;
        let (ctrl_tx, ctrl_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(connection_driver(
            Arc::clone(&shared),
            Arc::new(connector),
            ctrl_rx,
            cmd_rx,
            ready_tx,
        ));

        ready_rx
            .await
            .map_err(|_| DmsError::internal("connection driver stopped before connecting"))??;

        Ok(Self {
            inner: Arc::new(ClientInner {
                shared,
                ctrl_tx,
                cmd_tx,
            }),
        })
    }

    /// Send a command and wait for its response.
    ///
    /// `timeout` overrides the configured request timeout. Dropping the
    /// returned future cancels the request.
    pub async fn issue_request(
        &self,
        command: impl Into<Command>,
        timeout: Option<Duration>,
    ) -> DmsResult<ResponsePayload> {
        let generation = self.inner.connected_generation()?;
        self.inner
            .request(&command.into(), None, generation, timeout)
            .await
    }

    /// Read one datapoint.
    pub async fn get(&self, path: impl Into<String>) -> DmsResult<GetResponse> {
        self.issue_request(GetCommand::new(path), None)
            .await?
            .decode_first()
    }

    /// Run a get with options; query gets may return many datapoints.
    pub async fn get_with(&self, command: GetCommand) -> DmsResult<Vec<GetResponse>> {
        self.issue_request(command, None).await?.decode_items()
    }

    /// Find datapoints below `path` matching `query`.
    pub async fn search(
        &self,
        path: impl Into<String>,
        query: Query,
    ) -> DmsResult<Vec<GetResponse>> {
        self.get_with(GetCommand::new(path).query(query)).await
    }

    /// Fetch trend samples of a datapoint.
    ///
    /// A datapoint without samples in the range yields an empty series.
    pub async fn trend(
        &self,
        path: impl Into<String>,
        hist_data: HistData,
    ) -> DmsResult<HistDataSeries> {
        let response: GetResponse = self
            .issue_request(GetCommand::new(path).hist_data(hist_data), None)
            .await?
            .decode_first()?;
        Ok(response
            .hist_data
            .unwrap_or(HistDataSeries::Compact(Vec::new())))
    }

    /// Fetch the alarm or protocol log of a datapoint.
    pub async fn alarm_log(
        &self,
        path: impl Into<String>,
        range: ChangelogRange,
    ) -> DmsResult<ChangelogEntries> {
        let response: GetResponse = self
            .issue_request(GetCommand::new(path).changelog(range), None)
            .await?
            .decode_first()?;
        Ok(response
            .changelog
            .unwrap_or(ChangelogEntries::Protocol(Vec::new())))
    }

    /// Write a scalar value to a datapoint.
    pub async fn set(
        &self,
        path: impl Into<String>,
        value: impl Into<Value>,
    ) -> DmsResult<SetResponse> {
        self.set_with(SetCommand::new(path, value)).await
    }

    /// Write with options (create, type, stamp).
    pub async fn set_with(&self, command: SetCommand) -> DmsResult<SetResponse> {
        self.issue_request(command, None).await?.decode_first()
    }

    pub async fn rename(
        &self,
        path: impl Into<String>,
        new_path: impl Into<String>,
    ) -> DmsResult<RenameResponse> {
        self.issue_request(RenameCommand::new(path, new_path), None)
            .await?
            .decode_first()
    }

    pub async fn delete(
        &self,
        path: impl Into<String>,
        recursive: bool,
    ) -> DmsResult<Vec<DeleteResponse>> {
        self.issue_request(DeleteCommand::new(path).recursive(recursive), None)
            .await?
            .decode_items()
    }

    /// Names of the changelog groups known to the DMS.
    pub async fn changelog_groups(&self) -> DmsResult<Vec<String>> {
        let response: ChangelogGroupsResponse = self
            .issue_request(Command::ChangelogGetGroups, None)
            .await?
            .decode_first()?;
        Ok(response.groups)
    }

    pub async fn changelog_read(
        &self,
        command: ChangelogReadCommand,
    ) -> DmsResult<ChangelogReadResponse> {
        self.issue_request(command, None).await?.decode_first()
    }

    /// Subscribe to events of a datapoint.
    ///
    /// The handler only receives events once the DMS confirmed the
    /// subscription. Subscriptions do not survive a reconnect.
    pub async fn subscribe<H: EventHandler>(
        &self,
        command: SubscribeCommand,
        handler: H,
    ) -> DmsResult<Subscription> {
        let generation = self.inner.connected_generation()?;
        let shared = &self.inner.shared;
        let path = command.path.clone();
        let command = Command::from(command);
        command.validate()?;

        let tag = Tag::new();
        let state = shared
            .registry
            .add(tag.clone(), path.clone(), Arc::new(handler), generation)?;
        let mut staged = StagedSubscription {
            registry: &shared.registry,
            tag: tag.clone(),
            armed: true,
        };

        let payload = self
            .inner
            .request(&command, Some(tag.clone()), generation, None)
            .await?;
        let initial: SubscriptionResponse = payload.decode_first()?;

        if !shared.registry.activate(&tag) {
            return Err(DmsError::Cancelled {
                tag: tag.to_string(),
            });
        }
        staged.armed = false;
        debug!(tag = %tag, path = %path, generation = %generation, "Subscribed");

        Ok(Subscription {
            id: SubscriptionId { tag, generation },
            path,
            state,
            initial,
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Stop a subscription. Events stop before the unsubscribe command is
    /// sent; a failed command is returned but does not resume delivery.
    ///
    /// Unsubscribing twice is a no-op.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> DmsResult<()> {
        self.inner.unsubscribe(id).await
    }

    /// Close the connection, failing everything in flight.
    ///
    /// The client stays usable through [`reconnect`](Self::reconnect).
    pub async fn close(&self) -> DmsResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inner
            .ctrl_tx
            .send(ControlCommand::Close { done: done_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }

    /// Drop the current connection, if any, and connect again as a new
    /// generation. Pending requests and subscriptions are not carried over.
    pub async fn reconnect(&self) -> DmsResult<Generation> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .ctrl_tx
            .send(ControlCommand::Reconnect { reply: reply_tx })
            .await
            .map_err(|_| DmsError::internal("connection driver stopped"))?;
        reply_rx
            .await
            .map_err(|_| DmsError::internal("connection driver stopped"))?
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.shared.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch connection status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.shared.watch_status()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Registered subscriptions, including ones still awaiting confirmation.
    pub fn subscription_count(&self) -> usize {
        self.inner.shared.registry.len()
    }

    pub fn config(&self) -> &DmsConfig {
        &self.inner.shared.config
    }
}

/// Handle to an active subscription.
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription {
    id: SubscriptionId,
    path: String,
    state: Arc<SubscriptionState>,
    initial: SubscriptionResponse,
    client: Weak<ClientInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("status", &self.status())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.state.get()
    }

    /// The DMS reply to the subscribe command, with the current value.
    pub fn initial_response(&self) -> &SubscriptionResponse {
        &self.initial
    }

    /// Change the event filter and query in place.
    ///
    /// Re-sends the subscribe command with this subscription's path and tag.
    pub async fn update(
        &self,
        event: EventMask,
        query: Option<Query>,
    ) -> DmsResult<SubscriptionResponse> {
        if self.status() != SubscriptionStatus::Active {
            return Err(DmsError::Cancelled {
                tag: self.id.tag.to_string(),
            });
        }
        let client = self.client()?;
        let generation = client.connected_generation()?;
        if generation != self.id.generation {
            return Err(DmsError::connection_lost(format!(
                "subscription {} belongs to a closed connection",
                self.id
            )));
        }

        let mut command = SubscribeCommand::new(self.path.clone()).event(event);
        if let Some(query) = query {
            command = command.query(query);
        }
        client
            .request(
                &Command::from(command),
                Some(self.id.tag.clone()),
                generation,
                None,
            )
            .await?
            .decode_first()
    }

    /// Stop this subscription. See [`DmsClient::unsubscribe`].
    pub async fn unsubscribe(&self) -> DmsResult<()> {
        self.client()?.unsubscribe(&self.id).await
    }

    fn client(&self) -> DmsResult<Arc<ClientInner>> {
        self.client
            .upgrade()
            .ok_or_else(|| DmsError::connection_lost("client was dropped"))
    }
}
