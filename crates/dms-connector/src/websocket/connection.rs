//! Connection driver.
//!
//! One task owns the websocket. It serializes outbound frames, reads and
//! routes inbound frames, answers keep-alive traffic and walks the
//! connection state machine, including reconnects.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, sleep, timeout},
};
use tracing::{debug, info, warn};

use super::{
    codec::{DmsCodec, Inbound},
    config::DmsConfig,
    dispatcher::EventDispatcher,
    pending::PendingTable,
    subscription::SubscriptionRegistry,
    transport::{Connector, FrameStream, WsFrame, WsWriter},
    types::{ConnectionState, ConnectionStatus, Generation, Tag},
};
use crate::{
    error::{DmsError, DmsResult},
    messages::CommandKind,
    reconnect::calculate_backoff,
};

#[derive(Debug)]
pub(crate) enum ControlCommand {
    Close {
        done: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<DmsResult<Generation>>,
    },
}

#[derive(Debug)]
pub(crate) enum DataCommand {
    Request {
        frame: String,
        tag: Tag,
        generation: Generation,
    },
}

/// State shared by the client handles and the driver.
pub(crate) struct Shared {
    pub(crate) config: DmsConfig,
    pub(crate) codec: DmsCodec,
    pub(crate) pending: PendingTable,
    pub(crate) registry: SubscriptionRegistry,
    status: watch::Sender<ConnectionStatus>,
}

impl Shared {
    /// Must be called inside a tokio runtime; it starts the event dispatcher.
    pub(crate) fn new(config: DmsConfig) -> Self {
        let dispatcher = EventDispatcher::spawn(
            config.callback_duration_warning,
            config.event_queue_warn_size,
        );
        let (status, _) = watch::channel(ConnectionStatus::initial());
        Self {
            codec: DmsCodec::new(config.whois.clone(), config.user.clone()),
            pending: PendingTable::new(config.max_pending_requests),
            registry: SubscriptionRegistry::new(dispatcher),
            status,
            config,
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: ConnectionState, generation: Generation) {
        self.status.send_replace(ConnectionStatus { state, generation });
    }

    /// Terminate everything that belongs to the current generation.
    fn terminate_generation(&self, error: &DmsError) {
        let failed = self.pending.fail_all(error);
        let cancelled = self.registry.cancel_all(error);
        if failed > 0 || cancelled > 0 {
            info!(
                failed_requests = failed,
                cancelled_subscriptions = cancelled,
                reason = %error,
                "Terminated connection state"
            );
        }
    }
}

enum Phase {
    Connect {
        reply: Option<oneshot::Sender<DmsResult<Generation>>>,
        attempt: u32,
        initial: bool,
    },
    Backoff {
        attempt: u32,
    },
    Idle,
    Exit,
}

/// How a connected session ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    Closed {
        done: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<DmsResult<Generation>>,
    },
    Lost(DmsError),
    Shutdown,
}

async fn open(
    shared: &Shared,
    connector: &dyn Connector,
) -> DmsResult<(FrameStream, Box<dyn WsWriter>)> {
    let connect_timeout = shared.config.connect_timeout;
    timeout(connect_timeout, connector.connect(&shared.config))
        .await
        .map_err(|_| {
            DmsError::connect_failed(format!("timed out after {}ms", connect_timeout.as_millis()))
        })?
}

pub(crate) async fn connection_driver(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    mut ctrl_rx: mpsc::Receiver<ControlCommand>,
    mut cmd_rx: mpsc::Receiver<DataCommand>,
    ready: oneshot::Sender<DmsResult<Generation>>,
) {
    let policy = shared.config.reconnect;
    let mut generation = Generation::default();
    let mut phase = Phase::Connect {
        reply: Some(ready),
        attempt: 0,
        initial: true,
    };

    debug!(url = %shared.config.url(), "Connection driver started");

    loop {
        phase = match phase {
            Phase::Connect {
                reply,
                attempt,
                initial,
            } => {
                shared.set_state(ConnectionState::Connecting, generation);
                match open(&shared, connector.as_ref()).await {
                    Ok((reader, mut writer)) => {
                        generation = generation.next();
                        shared.set_state(ConnectionState::Connected, generation);
                        info!(generation = %generation, url = %shared.config.url(), "Connected to DMS");
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(generation));
                        }

                        let end = connection_task(
                            &shared,
                            generation,
                            &mut ctrl_rx,
                            &mut cmd_rx,
                            reader,
                            writer.as_mut(),
                        )
                        .await;
                        end_session(&shared, generation, end)
                    }
                    Err(err) => {
                        warn!(error = %err, attempt, "Failed to connect to DMS");
                        shared.set_state(ConnectionState::Failed, generation);
                        shared.terminate_generation(&err);
                        match reply {
                            Some(reply) => {
                                let _ = reply.send(Err(err));
                                if initial {
                                    Phase::Exit
                                } else {
                                    shared.set_state(ConnectionState::Disconnected, generation);
                                    Phase::Idle
                                }
                            }
                            None => {
                                let next = attempt.saturating_add(1);
                                if policy.allows_attempt(next) {
                                    Phase::Backoff { attempt: next }
                                } else {
                                    warn!(attempts = next, "Giving up reconnecting to DMS");
                                    shared.set_state(ConnectionState::Disconnected, generation);
                                    Phase::Idle
                                }
                            }
                        }
                    }
                }
            }
            Phase::Backoff { attempt } => {
                let delay = calculate_backoff(&policy, attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to DMS");
                wait_backoff(&shared, &mut ctrl_rx, &mut cmd_rx, delay, attempt).await
            }
            Phase::Idle => wait_idle(&shared, &mut ctrl_rx, &mut cmd_rx).await,
            Phase::Exit => break,
        };
    }

    shared.set_state(ConnectionState::Disconnected, generation);
    shared.terminate_generation(&DmsError::connection_lost("client shut down"));
    cmd_rx.close();
    while let Ok(command) = cmd_rx.try_recv() {
        reject_request(&shared, command);
    }
    debug!("Connection driver stopped");
}

fn end_session(shared: &Shared, generation: Generation, end: SessionEnd) -> Phase {
    let policy = shared.config.reconnect;
    match end {
        SessionEnd::Closed { done } => {
            shared.set_state(ConnectionState::Closing, generation);
            shared.terminate_generation(&DmsError::connection_lost("connection closed by client"));
            shared.set_state(ConnectionState::Disconnected, generation);
            info!(generation = %generation, "Connection closed");
            let _ = done.send(());
            Phase::Idle
        }
        SessionEnd::Reconnect { reply } => {
            shared.terminate_generation(&DmsError::connection_lost("reconnect requested"));
            Phase::Connect {
                reply: Some(reply),
                attempt: 0,
                initial: false,
            }
        }
        SessionEnd::Lost(err) => {
            warn!(generation = %generation, error = %err, "Connection to DMS lost");
            shared.set_state(ConnectionState::Failed, generation);
            let err = match err {
                DmsError::ConnectionLost { .. } => err,
                other => DmsError::connection_lost(other.to_string()),
            };
            shared.terminate_generation(&err);
            if policy.allows_attempt(0) {
                Phase::Backoff { attempt: 0 }
            } else {
                shared.set_state(ConnectionState::Disconnected, generation);
                Phase::Idle
            }
        }
        SessionEnd::Shutdown => Phase::Exit,
    }
}

fn reject_request(shared: &Shared, command: DataCommand) {
    let DataCommand::Request { tag, .. } = command;
    shared.pending.fail(
        &tag,
        DmsError::NotConnected {
            state: shared.status().state,
        },
    );
}

async fn wait_backoff(
    shared: &Shared,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    cmd_rx: &mut mpsc::Receiver<DataCommand>,
    delay: Duration,
    attempt: u32,
) -> Phase {
    let sleep = sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            ctrl = ctrl_rx.recv() => {
                return match ctrl {
                    Some(ControlCommand::Close { done }) => {
                        shared.set_state(ConnectionState::Disconnected, shared.status().generation);
                        let _ = done.send(());
                        Phase::Idle
                    }
                    Some(ControlCommand::Reconnect { reply }) => Phase::Connect {
                        reply: Some(reply),
                        attempt: 0,
                        initial: false,
                    },
                    None => Phase::Exit,
                };
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => reject_request(shared, command),
                    None => return Phase::Exit,
                }
            }
            _ = &mut sleep => {
                return Phase::Connect {
                    reply: None,
                    attempt,
                    initial: false,
                };
            }
        }
    }
}

async fn wait_idle(
    shared: &Shared,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    cmd_rx: &mut mpsc::Receiver<DataCommand>,
) -> Phase {
    loop {
        tokio::select! {
            biased;
            ctrl = ctrl_rx.recv() => {
                match ctrl {
                    Some(ControlCommand::Close { done }) => {
                        let _ = done.send(());
                    }
                    Some(ControlCommand::Reconnect { reply }) => {
                        return Phase::Connect {
                            reply: Some(reply),
                            attempt: 0,
                            initial: false,
                        };
                    }
                    None => return Phase::Exit,
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => reject_request(shared, command),
                    None => return Phase::Exit,
                }
            }
        }
    }
}

/// Run one connected session until it ends.
pub(crate) async fn connection_task<R>(
    shared: &Shared,
    generation: Generation,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    cmd_rx: &mut mpsc::Receiver<DataCommand>,
    mut reader: R,
    writer: &mut dyn WsWriter,
) -> SessionEnd
where
    R: Stream<Item = DmsResult<WsFrame>> + Unpin + Send,
{
    let config = &shared.config;
    let mut ping_interval =
        tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    let pong_deadline = sleep(config.pong_timeout);
    tokio::pin!(pong_deadline);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            biased;
            ctrl = ctrl_rx.recv() => {
                writer.close().await;
                return match ctrl {
                    Some(ControlCommand::Close { done }) => SessionEnd::Closed { done },
                    Some(ControlCommand::Reconnect { reply }) => SessionEnd::Reconnect { reply },
                    None => SessionEnd::Shutdown,
                };
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(DataCommand::Request { frame, tag, generation: request_generation }) => {
                        if request_generation != generation {
                            shared.pending.fail(
                                &tag,
                                DmsError::connection_lost(format!(
                                    "request was issued on connection {request_generation}"
                                )),
                            );
                            continue;
                        }
                        if let Err(err) = writer.send_frame(WsFrame::Text(frame)).await {
                            shared.pending.fail(&tag, err.clone());
                            return SessionEnd::Lost(err);
                        }
                    }
                    None => {
                        writer.close().await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
            frame = reader.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        if frame.payload_len() > config.max_message_size {
                            warn!(
                                size = frame.payload_len(),
                                max = config.max_message_size,
                                "Dropping oversized websocket frame"
                            );
                            continue;
                        }
                        match frame {
                            WsFrame::Text(text) => route_text(shared, &text),
                            WsFrame::Binary(data) => {
                                debug!(len = data.len(), "Ignoring binary frame");
                            }
                            WsFrame::Ping(data) => {
                                if !writer.answers_pings()
                                    && let Err(err) = writer.send_frame(WsFrame::Pong(data)).await
                                {
                                    return SessionEnd::Lost(err);
                                }
                            }
                            WsFrame::Pong(_) => awaiting_pong = false,
                            WsFrame::Close(reason) => {
                                let reason = reason.unwrap_or_else(|| "no reason".to_string());
                                return SessionEnd::Lost(DmsError::connection_lost(format!(
                                    "closed by server: {reason}"
                                )));
                            }
                        }
                    }
                    Some(Err(err)) if err.is_connection_error() => {
                        warn!(error = %err, "Websocket read error");
                        return SessionEnd::Lost(err);
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "Dropping unreadable websocket frame");
                    }
                    None => {
                        return SessionEnd::Lost(DmsError::connection_lost("connection closed by peer"));
                    }
                }
            }
            _ = ping_interval.tick(), if config.use_websocket_ping => {
                if let Err(err) = writer.send_frame(WsFrame::Ping(Bytes::new())).await {
                    return SessionEnd::Lost(err);
                }
                if !awaiting_pong {
                    awaiting_pong = true;
                    pong_deadline.as_mut().reset(Instant::now() + config.pong_timeout);
                }
            }
            _ = &mut pong_deadline, if awaiting_pong => {
                warn!(timeout_ms = config.pong_timeout.as_millis() as u64, "Pong timeout");
                return SessionEnd::Lost(DmsError::connection_lost("pong timeout"));
            }
        }
    }
}

fn route_text(shared: &Shared, text: &str) {
    let messages = match shared.codec.decode(text) {
        Ok(messages) => messages,
        Err(err) => {
            warn!(error = %err, len = text.len(), "Dropping undecodable frame");
            return;
        }
    };

    for message in messages {
        match message {
            Inbound::Response(payload) => {
                let tag = payload.tag.clone();
                let subscribe = payload.kind == CommandKind::Subscribe;
                if shared.pending.fulfil(&tag, payload) && subscribe {
                    shared.registry.activate(&tag);
                }
            }
            Inbound::ProtocolError {
                tag: Some(tag),
                error,
            } => {
                if !shared.pending.fail(&tag, error.clone()) {
                    warn!(tag = %tag, error = %error, "Unsolicited error from DMS");
                }
            }
            Inbound::ProtocolError { tag: None, error } => {
                warn!(error = %error, "Uncorrelated error from DMS");
            }
            Inbound::Event(event) => {
                shared.registry.dispatch(event);
            }
        }
    }
}
