//! Transport session supervisor.
//!
//! One supervisor task per logged-in user owns the socket. It:
//!
//! 1. opens a [`Connection`] through the [`Transport`],
//! 2. sends `auth { token }` and waits for `auth:ok` / `auth:error`,
//! 3. pumps outbound [`ClientEvent`]s and decodes inbound [`ServerEvent`]s,
//! 4. on an unexpected disconnect, retries with exponential backoff and
//!    jitter until connected again, the attempt limit is hit, or the token is
//!    rejected.
//!
//! The connection state is published on a `watch` channel; everything else
//! is reported as [`SessionEvent`]s.

use std::time::Duration;

use studychat_proto::codec;
use studychat_proto::event::{ClientEvent, ServerEvent};
use studychat_proto::ids::UserId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{Connection, ConnectionState, SessionEvent, Transport, TransportError};
use crate::config::{ClientConfig, ReconnectConfig};

/// Settings for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Timeout for the `auth` handshake.
    pub auth_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            auth_timeout: config.network.auth_timeout,
            reconnect: config.reconnect.clone(),
            channel_capacity: config.network.channel_capacity,
        }
    }
}

/// Commands from the handle to the supervisor.
#[derive(Debug)]
enum SessionCommand {
    Send(ClientEvent),
    Shutdown,
}

/// Owner's handle to a running session.
///
/// Dropping the handle without calling [`SessionHandle::disconnect`] also
/// stops the supervisor once it notices the command channel closed.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queue an event for the socket.
    ///
    /// Never waits: the event loop calling this must not block on the
    /// supervisor, which may itself be waiting to deliver events to it.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] while the socket is not connected.
    /// - [`TransportError::Backpressure`] if the outbound queue is full.
    /// - [`TransportError::ConnectionClosed`] once the session has stopped.
    pub fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.commands
            .try_send(SessionCommand::Send(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
            })
    }

    /// A receiver observing the connection state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The current connection state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the supervisor task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the socket and stop the supervisor.
    pub async fn disconnect(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "session task ended abnormally");
        }
    }
}

/// Spawn a session supervisor.
///
/// Returns the handle and the receiver of [`SessionEvent`]s. The first
/// connection attempt starts immediately.
pub fn spawn_session<T: Transport>(
    transport: T,
    token: String,
    config: SessionConfig,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
    let capacity = config.channel_capacity.max(1);
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let supervisor = Supervisor {
        transport,
        token,
        config,
        commands: cmd_rx,
        events: event_tx,
        state: state_tx,
    };
    let task = tokio::spawn(supervisor.run());

    (
        SessionHandle {
            commands: cmd_tx,
            state: state_rx,
            task,
        },
        event_rx,
    )
}

/// How a connected phase ended.
enum Exit {
    /// Owner asked to stop (or dropped the handle).
    Shutdown,
    /// The socket went away.
    Lost,
}

struct Supervisor<T> {
    transport: T,
    token: String,
    config: SessionConfig,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport> Supervisor<T> {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        self.set_state(ConnectionState::Connecting).await;

        loop {
            match self.connect().await {
                Ok((conn, user_id)) => {
                    attempt = 0;
                    tracing::info!(user_id = %user_id, "session authenticated");
                    self.emit(SessionEvent::Connected { user_id }).await;
                    self.set_state(ConnectionState::Connected).await;

                    match self.pump(conn).await {
                        Exit::Shutdown => break,
                        Exit::Lost => {
                            tracing::warn!("socket connection lost");
                        }
                    }
                }
                Err(TransportError::AuthRejected(reason)) => {
                    tracing::warn!(reason = %reason, "authentication rejected, not retrying");
                    self.emit(SessionEvent::AuthRejected { reason }).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "connection attempt failed");
                }
            }

            attempt = attempt.saturating_add(1);
            if self.config.reconnect.exhausted(attempt) {
                tracing::warn!(attempts = attempt - 1, "giving up on reconnecting");
                self.emit(SessionEvent::ReconnectFailed).await;
                break;
            }

            let delay = self.config.reconnect.delay_with_jitter(attempt);
            self.set_state(ConnectionState::Reconnecting).await;
            self.emit(SessionEvent::Reconnecting {
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            })
            .await;
            tracing::info!(attempt, delay_ms = delay.as_millis(), "reconnecting");

            if matches!(self.backoff(delay).await, Exit::Shutdown) {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        tracing::info!("session supervisor exiting");
    }

    /// Open a connection and authenticate on it.
    async fn connect(&self) -> Result<(Connection, UserId), TransportError> {
        let mut conn = self.transport.open().await?;

        let auth = codec::encode(&ClientEvent::Auth {
            token: self.token.clone(),
        })
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
        conn.outbound
            .send(auth)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        let user_id = tokio::time::timeout(self.config.auth_timeout, await_auth(&mut conn))
            .await
            .map_err(|_| {
                tracing::warn!("auth acknowledgement timed out");
                TransportError::Timeout
            })??;
        Ok((conn, user_id))
    }

    /// Move frames until the connection drops or the owner shuts down.
    async fn pump(&mut self, mut conn: Connection) -> Exit {
        loop {
            tokio::select! {
                frame = conn.inbound.recv() => {
                    let Some(frame) = frame else {
                        return Exit::Lost;
                    };
                    match codec::decode::<ServerEvent>(&frame) {
                        Ok(event) => {
                            if self.events.send(SessionEvent::Server(event)).await.is_err() {
                                return Exit::Shutdown;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed frame, skipping");
                        }
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Send(event)) => {
                        let name = event.name();
                        let frame = match codec::encode(&event) {
                            Ok(f) => f,
                            Err(e) => {
                                tracing::warn!(event = name, error = %e, "failed to encode event");
                                continue;
                            }
                        };
                        if conn.outbound.send(frame).await.is_err() {
                            tracing::warn!(event = name, "socket writer gone while sending");
                            return Exit::Lost;
                        }
                        tracing::trace!(event = name, "event sent");
                    }
                    Some(SessionCommand::Shutdown) | None => return Exit::Shutdown,
                },
            }
        }
    }

    /// Sleep for `delay` while draining commands. Sends are dropped.
    async fn backoff(&mut self, delay: Duration) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Exit::Lost,
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Send(event)) => {
                        tracing::debug!(event = event.name(), "dropping event while disconnected");
                    }
                    Some(SessionCommand::Shutdown) | None => return Exit::Shutdown,
                },
            }
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(SessionEvent::StateChanged(state)).await;
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("session event receiver dropped");
        }
    }
}

/// Wait for the handshake reply. Other frames before it are skipped.
async fn await_auth(conn: &mut Connection) -> Result<UserId, TransportError> {
    while let Some(frame) = conn.inbound.recv().await {
        match codec::decode::<ServerEvent>(&frame) {
            Ok(ServerEvent::AuthOk { user_id }) => return Ok(user_id),
            Ok(ServerEvent::AuthError { reason }) => {
                return Err(TransportError::AuthRejected(reason));
            }
            Ok(other) => {
                tracing::debug!(event = other.name(), "ignoring event before auth:ok");
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame during auth");
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}
