//! The chat client event loop and its handle.
//!
//! [`ChatClient::start`] spawns the transport session and one loop task that
//! owns every piece of chat state. The loop selects over:
//!
//! 1. commands from [`ChatHandle`]s,
//! 2. [`SessionEvent`]s from the transport session,
//! 3. results of spawned network tasks (history, sends, uploads, receipts),
//! 4. a timer tick for join timeouts, typing expiry and read coalescing.
//!
//! Network calls never run on the loop itself; they are spawned and report
//! back through the task channel, so a slow REST call never stalls live
//! events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use studychat_proto::event::{ClientEvent, ServerEvent};
use studychat_proto::ids::{AttachmentId, LocalId, MessageId, RoomId, Timestamp, UserId};
use studychat_proto::message::{self, Message, MessageKind, Position};
use studychat_proto::rest::{HistoryPage, HistoryQuery, PostMessage, ReadAck, RoomSummary};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::ChatEvent;
use super::presence::{PresenceTracker, TypingThrottle};
use super::read::{ReadState, ReadTracker};
use super::room::{RoomEffects, RoomRegistry, RoomWaiter};
use super::store::{ConfirmOutcome, DeliveryState, MessageStore, ReceiveOutcome, StoredMessage};
use super::upload::{Attachment, OutgoingFile, UploadError, UploadUpdate, Uploader, run_upload};
use crate::api::{ApiError, ChatApi};
use crate::cache::{self, JsonCache};
use crate::config::ClientConfig;
use crate::error::ChatError;
use crate::transport::{
    ConnectionState, SessionConfig, SessionEvent, SessionHandle, Transport, spawn_session,
};

/// Outcome of a history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLoad {
    /// Messages new to the store.
    pub inserted: usize,
    /// Whether older pages exist.
    pub has_more: bool,
}

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Latest,
    Before(MessageId),
    Older,
}

enum Command {
    JoinRoom {
        room: RoomId,
        waiter: RoomWaiter,
    },
    LeaveRoom {
        room: RoomId,
        waiter: RoomWaiter,
    },
    CloseRoom {
        room: RoomId,
    },
    LoadHistory {
        room: RoomId,
        cursor: Cursor,
        reply: Reply<HistoryLoad>,
    },
    SendMessage {
        room: RoomId,
        content: String,
        reply: Reply<LocalId>,
    },
    RetryMessage {
        room: RoomId,
        local_id: LocalId,
        reply: Reply<()>,
    },
    MarkRead {
        room: RoomId,
        position: Option<Position>,
        reply: Reply<()>,
    },
    Typing {
        room: RoomId,
    },
    StopTyping {
        room: RoomId,
    },
    Upload {
        room: RoomId,
        file: OutgoingFile,
        reply: Reply<AttachmentId>,
    },
    RetryUpload {
        attachment_id: AttachmentId,
        reply: Reply<()>,
    },
    Snapshot {
        room: RoomId,
        reply: oneshot::Sender<Vec<StoredMessage>>,
    },
    TypingIn {
        room: RoomId,
        reply: oneshot::Sender<Vec<UserId>>,
    },
    IsOnline {
        user: UserId,
        reply: oneshot::Sender<bool>,
    },
    ReadStateOf {
        room: RoomId,
        reply: oneshot::Sender<ReadState>,
    },
    JoinedRooms {
        reply: oneshot::Sender<Vec<RoomId>>,
    },
    AttachmentOf {
        attachment_id: AttachmentId,
        reply: oneshot::Sender<Option<Attachment>>,
    },
    CurrentUser {
        reply: oneshot::Sender<Option<UserId>>,
    },
    ListRooms {
        reply: Reply<Vec<RoomSummary>>,
    },
    GetRoom {
        room: RoomId,
        reply: Reply<RoomSummary>,
    },
    Search {
        room: RoomId,
        keyword: String,
        reply: Reply<Vec<Message>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum TaskResult {
    History {
        room: RoomId,
        generation: u64,
        latest: bool,
        result: Result<HistoryPage, ApiError>,
    },
    Sent {
        room: RoomId,
        local_id: LocalId,
        result: Result<Message, ApiError>,
    },
    SendRetryDue {
        room: RoomId,
        local_id: LocalId,
    },
    ReadSent {
        room: RoomId,
        up_to: Position,
        result: Result<ReadAck, ApiError>,
    },
    Upload(UploadUpdate),
}

impl From<UploadUpdate> for TaskResult {
    fn from(update: UploadUpdate) -> Self {
        Self::Upload(update)
    }
}

/// Owned handle to a running chat client.
///
/// Cheap to clone. The client shuts down when [`ChatHandle::shutdown`] is
/// called or the last handle is dropped.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ChatEvent>,
    state: watch::Receiver<ConnectionState>,
}

/// Handler registration returned by [`ChatHandle::on`]. Dropping it
/// unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ChatHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ChatError::Closed)?;
        rx.await.map_err(|_| ChatError::Closed)
    }

    async fn try_call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ChatError> {
        self.call(make).await?
    }

    /// Join `room`, waiting for the hub's acknowledgement.
    ///
    /// Returns at once if the room is already joined.
    ///
    /// # Errors
    ///
    /// [`ChatError::JoinTimeout`], [`ChatError::JoinRejected`] or
    /// [`ChatError::Closed`].
    pub async fn join_room(&self, room: &RoomId) -> Result<(), ChatError> {
        let result = self
            .call(|waiter| Command::JoinRoom {
                room: room.clone(),
                waiter,
            })
            .await?;
        result.map_err(|e| ChatError::from_room(room, e))
    }

    /// Leave `room`. Local state is dropped without waiting for the hub.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn leave_room(&self, room: &RoomId) -> Result<(), ChatError> {
        let result = self
            .call(|waiter| Command::LeaveRoom {
                room: room.clone(),
                waiter,
            })
            .await?;
        result.map_err(|e| ChatError::from_room(room, e))
    }

    /// Stop viewing `room`: cancels its history fetches. The room stays
    /// joined.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn close_room(&self, room: &RoomId) -> Result<(), ChatError> {
        self.commands
            .send(Command::CloseRoom { room: room.clone() })
            .await
            .map_err(|_| ChatError::Closed)
    }

    /// Fetch the history page before `before` (the newest page for `None`)
    /// and merge it into the timeline.
    ///
    /// # Errors
    ///
    /// [`ChatError::Auth`] if the token was refused, [`ChatError::Network`]
    /// on a transient failure, [`ChatError::Api`] on any other REST error;
    /// [`ChatError::Closed`] if the room was closed or left while the fetch
    /// was queued or in flight.
    pub async fn load_history(
        &self,
        room: &RoomId,
        before: Option<MessageId>,
    ) -> Result<HistoryLoad, ChatError> {
        let cursor = before.map_or(Cursor::Latest, Cursor::Before);
        self.try_call(|reply| Command::LoadHistory {
            room: room.clone(),
            cursor,
            reply,
        })
        .await
    }

    /// Fetch the page before the oldest message currently stored.
    ///
    /// # Errors
    ///
    /// Same as [`ChatHandle::load_history`].
    pub async fn load_older(&self, room: &RoomId) -> Result<HistoryLoad, ChatError> {
        self.try_call(|reply| Command::LoadHistory {
            room: room.clone(),
            cursor: Cursor::Older,
            reply,
        })
        .await
    }

    /// Send a text message optimistically. Returns its local id at once;
    /// confirmation or failure arrives as a [`ChatEvent`].
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] for empty or oversized content,
    /// [`ChatError::NotJoined`] if the room is not joined.
    pub async fn send_message(&self, room: &RoomId, content: &str) -> Result<LocalId, ChatError> {
        self.try_call(|reply| Command::SendMessage {
            room: room.clone(),
            content: content.to_string(),
            reply,
        })
        .await
    }

    /// Resend a failed message (or resume its failed upload).
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] if there is no failed message `local_id`.
    pub async fn retry_message(&self, room: &RoomId, local_id: LocalId) -> Result<(), ChatError> {
        self.try_call(|reply| Command::RetryMessage {
            room: room.clone(),
            local_id,
            reply,
        })
        .await
    }

    /// Mark `room` read up to `position`, or up to its newest message.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn mark_read(&self, room: &RoomId, position: Option<Position>) -> Result<(), ChatError> {
        self.try_call(|reply| Command::MarkRead {
            room: room.clone(),
            position,
            reply,
        })
        .await
    }

    /// A local keystroke in `room`. Fire-and-forget.
    pub async fn typing(&self, room: &RoomId) {
        let _ = self
            .commands
            .send(Command::Typing { room: room.clone() })
            .await;
    }

    /// The local user stopped typing in `room`. Fire-and-forget.
    pub async fn stop_typing(&self, room: &RoomId) {
        let _ = self
            .commands
            .send(Command::StopTyping { room: room.clone() })
            .await;
    }

    /// Upload a file to `room` behind a placeholder message.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] if the type or size is not allowed,
    /// [`ChatError::NotJoined`] if the room is not joined.
    pub async fn upload(&self, room: &RoomId, file: OutgoingFile) -> Result<AttachmentId, ChatError> {
        self.try_call(|reply| Command::Upload {
            room: room.clone(),
            file,
            reply,
        })
        .await
    }

    /// Resume a failed upload from its first unacknowledged chunk.
    ///
    /// # Errors
    ///
    /// [`ChatError::Upload`] if the attachment is unknown or has not failed,
    /// [`ChatError::NotJoined`] if its room was left.
    pub async fn retry_upload(&self, attachment_id: AttachmentId) -> Result<(), ChatError> {
        self.try_call(|reply| Command::RetryUpload {
            attachment_id,
            reply,
        })
        .await
    }

    /// The ordered timeline of `room`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn snapshot(&self, room: &RoomId) -> Result<Vec<StoredMessage>, ChatError> {
        self.call(|reply| Command::Snapshot {
            room: room.clone(),
            reply,
        })
        .await
    }

    /// Users typing in `room` right now.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn typing_in(&self, room: &RoomId) -> Result<Vec<UserId>, ChatError> {
        self.call(|reply| Command::TypingIn {
            room: room.clone(),
            reply,
        })
        .await
    }

    /// Whether `user` is online.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn is_online(&self, user: &UserId) -> Result<bool, ChatError> {
        self.call(|reply| Command::IsOnline {
            user: user.clone(),
            reply,
        })
        .await
    }

    /// Local read state of `room`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn read_state(&self, room: &RoomId) -> Result<ReadState, ChatError> {
        self.call(|reply| Command::ReadStateOf {
            room: room.clone(),
            reply,
        })
        .await
    }

    /// Rooms currently joined.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn joined_rooms(&self) -> Result<Vec<RoomId>, ChatError> {
        self.call(|reply| Command::JoinedRooms { reply }).await
    }

    /// The attachment record for `attachment_id`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn attachment(&self, attachment_id: AttachmentId) -> Result<Option<Attachment>, ChatError> {
        self.call(|reply| Command::AttachmentOf {
            attachment_id,
            reply,
        })
        .await
    }

    /// The authenticated user, once the session has connected.
    ///
    /// # Errors
    ///
    /// [`ChatError::Closed`] if the client is gone.
    pub async fn current_user(&self) -> Result<Option<UserId>, ChatError> {
        self.call(|reply| Command::CurrentUser { reply }).await
    }

    /// `GET /rooms`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Auth`], [`ChatError::Network`] or [`ChatError::Api`].
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ChatError> {
        self.try_call(|reply| Command::ListRooms { reply }).await
    }

    /// `GET /rooms/{id}`: name, participants and last message of `room`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Auth`], [`ChatError::Network`] or [`ChatError::Api`]
    /// (`NotFound` for an unknown room).
    pub async fn get_room(&self, room: &RoomId) -> Result<RoomSummary, ChatError> {
        self.try_call(|reply| Command::GetRoom {
            room: room.clone(),
            reply,
        })
        .await
    }

    /// Search `room` for `keyword`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Auth`], [`ChatError::Network`] or [`ChatError::Api`].
    pub async fn search(&self, room: &RoomId, keyword: &str) -> Result<Vec<Message>, ChatError> {
        self.try_call(|reply| Command::Search {
            room: room.clone(),
            keyword: keyword.to_string(),
            reply,
        })
        .await
    }

    /// Receive every [`ChatEvent`] from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Run `handler` for every event until the returned [`Subscription`] is
    /// dropped.
    pub fn on<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(ChatEvent) + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver observing the connection state.
    #[must_use]
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the client and close the socket.
    pub async fn shutdown(self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }
}

/// Entry point of the chat core.
#[derive(Debug)]
pub struct ChatClient;

impl ChatClient {
    /// Start a client: connect the session with `token` and spawn the event
    /// loop. The message cache is opened from `config.cache` when enabled.
    pub fn start<A: ChatApi, T: Transport>(
        api: A,
        transport: T,
        token: String,
        config: ClientConfig,
    ) -> ChatHandle {
        let cache = open_cache(&config);
        Self::start_with_cache(api, transport, token, config, cache)
    }

    /// Like [`ChatClient::start`] with an explicit cache.
    pub fn start_with_cache<A: ChatApi, T: Transport>(
        api: A,
        transport: T,
        token: String,
        config: ClientConfig,
        cache: Option<JsonCache>,
    ) -> ChatHandle {
        let (session, session_events) =
            spawn_session(transport, token, SessionConfig::from(&config));
        let state = session.state();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.network.channel_capacity.max(1));
        let (events, _) = broadcast::channel(config.network.event_buffer.max(1));
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        let core = Core {
            api: Arc::new(api),
            user_id: None,
            rooms: RoomRegistry::new(config.rooms.join_timeout),
            presence: PresenceTracker::new(config.presence.typing_expiry),
            throttle: TypingThrottle::new(
                config.presence.typing_throttle,
                config.presence.typing_idle,
            ),
            store: MessageStore::new(),
            reads: ReadTracker::new(config.reads.coalesce),
            uploader: Uploader::new(config.upload.clone()),
            cache: cache.map(Arc::new),
            history: HashMap::new(),
            history_generation: 0,
            in_flight_sends: HashSet::new(),
            session,
            events: events.clone(),
            tasks: task_tx,
            config,
        };
        tokio::spawn(core.run(cmd_rx, session_events, task_rx));

        ChatHandle {
            commands: cmd_tx,
            events,
            state,
        }
    }
}

fn open_cache(config: &ClientConfig) -> Option<JsonCache> {
    if !config.cache.enabled {
        return None;
    }
    let dir = config.cache.resolved_dir()?;
    match JsonCache::open(&dir, config.cache.ttl) {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!(error = %e, "message cache unavailable");
            None
        }
    }
}

struct HistoryRequest {
    cursor: Cursor,
    reply: Option<Reply<HistoryLoad>>,
}

struct InFlightFetch {
    task: JoinHandle<()>,
    reply: Option<Reply<HistoryLoad>>,
}

struct HistoryPaging {
    generation: u64,
    in_flight: Option<InFlightFetch>,
    queued: VecDeque<HistoryRequest>,
}

impl HistoryPaging {
    const fn new(generation: u64) -> Self {
        Self {
            generation,
            in_flight: None,
            queued: VecDeque::new(),
        }
    }
}

struct Core<A> {
    api: Arc<A>,
    config: ClientConfig,
    session: SessionHandle,
    user_id: Option<UserId>,
    rooms: RoomRegistry,
    presence: PresenceTracker,
    throttle: TypingThrottle,
    store: MessageStore,
    reads: ReadTracker,
    uploader: Uploader,
    cache: Option<Arc<JsonCache>>,
    history: HashMap<RoomId, HistoryPaging>,
    /// Shared across rooms so a result from a dropped paging entry never
    /// matches a later one.
    history_generation: u64,
    in_flight_sends: HashSet<LocalId>,
    events: broadcast::Sender<ChatEvent>,
    tasks: mpsc::UnboundedSender<TaskResult>,
}

impl<A: ChatApi> Core<A> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut session_events: mpsc::Receiver<SessionEvent>,
        mut task_results: mpsc::UnboundedReceiver<TaskResult>,
    ) {
        let mut tick = tokio::time::interval(self.config.network.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session_open = true;
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = session_events.recv(), if session_open => match event {
                    Some(event) => self.handle_session_event(event),
                    None => session_open = false,
                },
                Some(result) = task_results.recv() => self.handle_task(result),
                _ = tick.tick() => self.on_tick(),
            }
        }

        tracing::info!("chat client shutting down");
        self.rooms.close();
        for (_, paging) in self.history.drain() {
            if let Some(fetch) = paging.in_flight {
                fetch.task.abort();
            }
        }
        // The supervisor may be parked on a full event channel; closing the
        // receivers releases it so it can see the shutdown command.
        drop(session_events);
        drop(task_results);
        self.session.disconnect().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn publish(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn is_connected(&self) -> bool {
        self.session.current_state() == ConnectionState::Connected
    }

    fn emit(&self, event: ClientEvent) -> bool {
        let name = event.name();
        if let Err(e) = self.session.send(event) {
            tracing::debug!(event = name, error = %e, "socket event not sent");
            return false;
        }
        true
    }

    // -- commands -----------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::JoinRoom { room, waiter } => {
                let effects = self.rooms.join(&room, Some(waiter), now);
                self.apply_room_effects(effects);
            }
            Command::LeaveRoom { room, waiter } => {
                if let Some(stop) = self.throttle.stop(&room) {
                    self.emit(stop);
                }
                if let Some(up_to) = self.reads.flush_room(&room) {
                    self.spawn_read_receipt(room.clone(), up_to);
                }
                self.cancel_history(&room);
                let effects = self.rooms.leave(&room, Some(waiter), now);
                self.apply_room_effects(effects);
            }
            Command::CloseRoom { room } => self.cancel_history(&room),
            Command::LoadHistory {
                room,
                cursor,
                reply,
            } => self.request_history(&room, cursor, Some(reply)),
            Command::SendMessage {
                room,
                content,
                reply,
            } => {
                let _ = reply.send(self.send_message(&room, &content));
            }
            Command::RetryMessage {
                room,
                local_id,
                reply,
            } => {
                let _ = reply.send(self.retry_message(&room, local_id));
            }
            Command::MarkRead {
                room,
                position,
                reply,
            } => {
                self.mark_read(&room, position, now);
                let _ = reply.send(Ok(()));
            }
            Command::Typing { room } => {
                if !self.rooms.is_joined(&room) {
                    return;
                }
                if let Some(event) = self.throttle.keystroke(&room, now) {
                    self.emit(event);
                }
            }
            Command::StopTyping { room } => {
                if let Some(event) = self.throttle.stop(&room) {
                    self.emit(event);
                }
            }
            Command::Upload { room, file, reply } => {
                let _ = reply.send(self.start_upload(&room, file));
            }
            Command::RetryUpload {
                attachment_id,
                reply,
            } => {
                let _ = reply.send(self.retry_upload(attachment_id));
            }
            Command::Snapshot { room, reply } => {
                let _ = reply.send(self.store.snapshot(&room));
            }
            Command::TypingIn { room, reply } => {
                let _ = reply.send(self.presence.typing_in(&room, now));
            }
            Command::IsOnline { user, reply } => {
                let _ = reply.send(self.presence.is_online(&user));
            }
            Command::ReadStateOf { room, reply } => {
                let _ = reply.send(self.reads.state(&room));
            }
            Command::JoinedRooms { reply } => {
                let _ = reply.send(self.rooms.joined_rooms());
            }
            Command::AttachmentOf {
                attachment_id,
                reply,
            } => {
                let _ = reply.send(self.uploader.get(attachment_id).cloned());
            }
            Command::CurrentUser { reply } => {
                let _ = reply.send(self.user_id.clone());
            }
            Command::ListRooms { reply } => {
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    let _ = reply.send(api.list_rooms().await.map_err(ChatError::from));
                });
            }
            Command::GetRoom { room, reply } => {
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    let _ = reply.send(api.get_room(&room).await.map_err(ChatError::from));
                });
            }
            Command::Search {
                room,
                keyword,
                reply,
            } => {
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    let _ = reply.send(api.search(&room, &keyword).await.map_err(ChatError::from));
                });
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn send_message(&mut self, room: &RoomId, content: &str) -> Result<LocalId, ChatError> {
        message::validate_text(content)?;
        if !self.rooms.is_joined(room) {
            return Err(ChatError::NotJoined(room.clone()));
        }
        let sender = self.user_id.clone().ok_or(ChatError::NotJoined(room.clone()))?;
        if let Some(stop) = self.throttle.stop(room) {
            self.emit(stop);
        }
        let local_id =
            self.store
                .insert_pending(room, &sender, content, MessageKind::Text, Timestamp::now());
        self.publish(ChatEvent::TimelineChanged {
            room_id: room.clone(),
        });
        if self.is_connected() {
            self.spawn_send(room, local_id);
        } else {
            tracing::debug!(room_id = %room, local_id = %local_id, "offline, message stays pending");
        }
        Ok(local_id)
    }

    fn retry_message(&mut self, room: &RoomId, local_id: LocalId) -> Result<(), ChatError> {
        if let Some(attachment) = self.uploader.for_local(local_id) {
            if matches!(attachment.status, super::UploadStatus::Failed(_)) {
                let attachment_id = attachment.attachment_id;
                return self.retry_upload(attachment_id);
            }
        }
        if self.store.retry(room, local_id).is_none() {
            return Err(ChatError::NotFound(format!("failed message {local_id}")));
        }
        self.publish(ChatEvent::TimelineChanged {
            room_id: room.clone(),
        });
        if self.is_connected() && !self.uploader.blocks_send(local_id) {
            self.spawn_send(room, local_id);
        }
        Ok(())
    }

    fn mark_read(&mut self, room: &RoomId, position: Option<Position>, now: Instant) {
        let Some(position) = position.or_else(|| self.store.latest_position(room)) else {
            return;
        };
        let before = self.reads.state(room);
        self.reads.mark_read(room, position, now);
        let after = self.reads.state(room);
        if before != after {
            self.publish(ChatEvent::ReadStateChanged {
                room_id: room.clone(),
                state: after,
            });
        }
    }

    fn start_upload(&mut self, room: &RoomId, file: OutgoingFile) -> Result<AttachmentId, ChatError> {
        let kind = self.uploader.validate(&file).map_err(|e| match e {
            UploadError::Validation(v) => ChatError::Validation(v),
            other => ChatError::Upload(other),
        })?;
        if !self.rooms.is_joined(room) {
            return Err(ChatError::NotJoined(room.clone()));
        }
        let sender = self.user_id.clone().ok_or(ChatError::NotJoined(room.clone()))?;
        let local_id =
            self.store
                .insert_pending(room, &sender, &file.file_name, kind, Timestamp::now());
        let attachment_id = self.uploader.register(room, local_id, file, kind);
        let job = self
            .uploader
            .start(attachment_id)
            .map_err(|e| ChatError::from_upload(attachment_id, e))?;
        tokio::spawn(run_upload(
            Arc::clone(&self.api),
            job,
            self.config.upload.clone(),
            self.tasks.clone(),
        ));
        self.publish(ChatEvent::TimelineChanged {
            room_id: room.clone(),
        });
        self.publish(ChatEvent::UploadProgress {
            attachment_id,
            room_id: room.clone(),
            progress: 0.0,
        });
        Ok(attachment_id)
    }

    fn retry_upload(&mut self, attachment_id: AttachmentId) -> Result<(), ChatError> {
        if let Some(attachment) = self
            .uploader
            .get(attachment_id)
            .filter(|a| !self.rooms.is_joined(&a.room_id))
        {
            return Err(ChatError::NotJoined(attachment.room_id.clone()));
        }
        let job = self
            .uploader
            .retry(attachment_id)
            .map_err(|e| ChatError::from_upload(attachment_id, e))?;
        if let Some(attachment) = self.uploader.get(attachment_id) {
            let (room, local_id) = (attachment.room_id.clone(), attachment.local_id);
            self.store.retry(&room, local_id);
            self.publish(ChatEvent::TimelineChanged { room_id: room });
        }
        tokio::spawn(run_upload(
            Arc::clone(&self.api),
            job,
            self.config.upload.clone(),
            self.tasks.clone(),
        ));
        Ok(())
    }

    // -- rooms and history --------------------------------------------------

    fn apply_room_effects(&mut self, effects: RoomEffects) {
        for event in effects.emit {
            let join = match &event {
                ClientEvent::Join { room_id, ack } => Some((room_id.clone(), *ack)),
                _ => None,
            };
            let sent = self.emit(event);
            if let (false, Some((room, ack))) = (sent, join) {
                self.rooms.join_not_sent(&room, ack);
            }
        }
        for (room, participants) in effects.joined {
            self.publish(ChatEvent::RoomJoined {
                room_id: room.clone(),
                participants,
            });
            // A leave queued behind the join already ran.
            if effects.left.contains(&room) {
                continue;
            }
            self.load_cached(&room);
            self.request_history(&room, Cursor::Latest, None);
        }
        for (room, error) in effects.failed {
            self.publish(ChatEvent::JoinFailed {
                room_id: room,
                reason: error.to_string(),
            });
        }
        for room in effects.left {
            self.forget_room(&room);
            self.publish(ChatEvent::RoomLeft { room_id: room });
        }
    }

    /// Drop every piece of per-room state once the room is left. The
    /// cached page stays on disk for the next join.
    fn forget_room(&mut self, room: &RoomId) {
        self.cancel_history(room);
        self.history.remove(room);
        self.presence.clear_room(room);
        self.store.clear_room(room);
        self.reads.forget(room);
        self.uploader.clear_room(room);
        tracing::debug!(room_id = %room, "room state dropped");
    }

    fn load_cached(&mut self, room: &RoomId) {
        if !self.store.is_empty(room) {
            return;
        }
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.get::<Vec<Message>>(&cache::messages_key(room)) {
            Ok(Some(messages)) if !messages.is_empty() => {
                let (_, inserted) = self.store.merge_history(room, messages);
                tracing::debug!(room_id = %room, inserted, "timeline seeded from cache");
                self.publish(ChatEvent::TimelineChanged {
                    room_id: room.clone(),
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(room_id = %room, error = %e, "cached timeline unreadable"),
        }
    }

    fn request_history(&mut self, room: &RoomId, cursor: Cursor, reply: Option<Reply<HistoryLoad>>) {
        let generation = self.history_generation;
        let paging = self
            .history
            .entry(room.clone())
            .or_insert_with(|| HistoryPaging::new(generation));
        if paging.in_flight.is_some() {
            paging.queued.push_back(HistoryRequest { cursor, reply });
            return;
        }
        self.start_fetch(room, HistoryRequest { cursor, reply });
    }

    fn start_fetch(&mut self, room: &RoomId, request: HistoryRequest) {
        let before = match request.cursor {
            Cursor::Latest => None,
            Cursor::Before(id) => Some(id),
            Cursor::Older => self.store.oldest_id(room),
        };
        let query = HistoryQuery {
            before,
            limit: Some(self.config.history.page_size),
        };
        let fresh = self.history_generation;
        let paging = self
            .history
            .entry(room.clone())
            .or_insert_with(|| HistoryPaging::new(fresh));
        let generation = paging.generation;
        let api = Arc::clone(&self.api);
        let tasks = self.tasks.clone();
        let task_room = room.clone();
        let task = tokio::spawn(async move {
            let result = api.history(&task_room, query).await;
            let _ = tasks.send(TaskResult::History {
                room: task_room,
                generation,
                latest: before.is_none(),
                result,
            });
        });
        tracing::debug!(room_id = %room, before = ?before, "history fetch started");
        paging.in_flight = Some(InFlightFetch {
            task,
            reply: request.reply,
        });
    }

    fn cancel_history(&mut self, room: &RoomId) {
        let Some(paging) = self.history.get_mut(room) else {
            return;
        };
        self.history_generation += 1;
        paging.generation = self.history_generation;
        if let Some(fetch) = paging.in_flight.take() {
            fetch.task.abort();
            if let Some(reply) = fetch.reply {
                let _ = reply.send(Err(ChatError::Closed));
            }
            tracing::debug!(room_id = %room, "history fetch cancelled");
        }
        for request in paging.queued.drain(..) {
            if let Some(reply) = request.reply {
                let _ = reply.send(Err(ChatError::Closed));
            }
        }
    }

    fn on_history(&mut self, room: &RoomId, generation: u64, latest: bool, result: Result<HistoryPage, ApiError>) {
        let Some(paging) = self.history.get_mut(room) else {
            return;
        };
        if paging.generation != generation {
            tracing::debug!(room_id = %room, "discarding stale history page");
            return;
        }
        let reply = paging.in_flight.take().and_then(|f| f.reply);

        let outcome = match result {
            Ok(page) => {
                let has_more = page.has_more;
                let (confirmed, inserted) = self.store.merge_history(room, page.messages);
                for local_id in &confirmed {
                    self.publish_confirmed(room, *local_id);
                }
                if inserted > 0 || !confirmed.is_empty() {
                    self.publish(ChatEvent::TimelineChanged {
                        room_id: room.clone(),
                    });
                }
                self.publish(ChatEvent::HistoryLoaded {
                    room_id: room.clone(),
                    inserted,
                    has_more,
                });
                if latest {
                    self.write_cache(room);
                }
                Ok(HistoryLoad { inserted, has_more })
            }
            Err(e) => {
                tracing::warn!(room_id = %room, error = %e, "history fetch failed");
                let error = ChatError::from(e);
                self.note_auth_failure(&error);
                Err(error)
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }

        let next = self
            .history
            .get_mut(room)
            .and_then(|paging| paging.queued.pop_front());
        if let Some(request) = next {
            self.start_fetch(room, request);
        }
    }

    fn write_cache(&self, room: &RoomId) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut messages = self.store.confirmed_messages(room);
        let keep = messages.len().saturating_sub(self.config.history.page_size);
        let messages = messages.split_off(keep);
        let cache = Arc::clone(cache);
        let room = room.clone();
        // File writes stay off the event loop.
        tokio::task::spawn_blocking(move || {
            if let Err(e) = cache.put(&cache::messages_key(&room), &messages[..]) {
                tracing::warn!(room_id = %room, error = %e, "failed to cache timeline");
            }
        });
    }

    /// A REST call was refused for the token: the session needs a new
    /// login, same as a rejected socket handshake.
    fn note_auth_failure(&self, error: &ChatError) {
        if let ChatError::Auth(reason) = error {
            self.publish(ChatEvent::AuthRejected {
                reason: reason.clone(),
            });
        }
    }

    // -- sends --------------------------------------------------------------

    fn spawn_send(&mut self, room: &RoomId, local_id: LocalId) {
        let Some(entry) = self.store.get(room, local_id) else {
            return;
        };
        if entry.state != DeliveryState::Pending || !self.in_flight_sends.insert(local_id) {
            return;
        }
        let body = PostMessage {
            content: entry.message.content.clone(),
            kind: entry.message.kind,
            local_id,
            created_at: Some(entry.message.created_at),
        };
        let attempt = self.store.record_attempt(room, local_id);
        tracing::debug!(room_id = %room, local_id = %local_id, attempt, "posting message");

        let api = Arc::clone(&self.api);
        let tasks = self.tasks.clone();
        let room = room.clone();
        tokio::spawn(async move {
            let result = api.post_message(&room, &body).await;
            let _ = tasks.send(TaskResult::Sent {
                room,
                local_id,
                result,
            });
        });
    }

    fn flush_pending(&mut self) {
        let pending: Vec<Message> = self.store.pending();
        for message in pending {
            let Some(local_id) = message.local_id else {
                continue;
            };
            if self.uploader.blocks_send(local_id) {
                continue;
            }
            self.spawn_send(&message.room_id, local_id);
        }
    }

    fn publish_confirmed(&self, room: &RoomId, local_id: LocalId) {
        if let Some(message_id) = self
            .store
            .get(room, local_id)
            .and_then(|e| e.message.message_id)
        {
            self.publish(ChatEvent::MessageConfirmed {
                room_id: room.clone(),
                local_id,
                message_id,
            });
        }
    }

    fn on_sent(&mut self, room: &RoomId, local_id: LocalId, result: Result<Message, ApiError>) {
        self.in_flight_sends.remove(&local_id);
        match result {
            Ok(message) => match self.store.confirm(room, local_id, &message) {
                ConfirmOutcome::Confirmed => {
                    self.publish_confirmed(room, local_id);
                    self.publish(ChatEvent::TimelineChanged {
                        room_id: room.clone(),
                    });
                }
                ConfirmOutcome::AlreadyConfirmed => {}
                ConfirmOutcome::Unknown => {
                    if self.store.receive(message) == ReceiveOutcome::Inserted {
                        self.publish(ChatEvent::TimelineChanged {
                            room_id: room.clone(),
                        });
                    }
                }
            },
            Err(e) => {
                let Some(entry) = self.store.get(room, local_id) else {
                    return;
                };
                if entry.state != DeliveryState::Pending {
                    return;
                }
                let attempts = entry.attempts;
                if !self.is_connected() && e.is_retryable() {
                    tracing::info!(room_id = %room, local_id = %local_id, error = %e, "send failed while offline, will retry on reconnect");
                    return;
                }
                if e.is_retryable() && attempts < self.config.network.send_attempts {
                    let delay = self.config.network.send_retry_delay * attempts;
                    tracing::info!(room_id = %room, local_id = %local_id, attempts, error = %e, "send failed, retrying");
                    self.in_flight_sends.insert(local_id);
                    let tasks = self.tasks.clone();
                    let room = room.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tasks.send(TaskResult::SendRetryDue { room, local_id });
                    });
                    return;
                }
                let error = ChatError::from(e);
                self.note_auth_failure(&error);
                let reason = error.to_string();
                if self.store.mark_failed(room, local_id, &reason) {
                    self.publish(ChatEvent::MessageFailed {
                        room_id: room.clone(),
                        local_id,
                        reason,
                    });
                    self.publish(ChatEvent::TimelineChanged {
                        room_id: room.clone(),
                    });
                }
            }
        }
    }

    // -- uploads ------------------------------------------------------------

    fn on_upload(&mut self, update: UploadUpdate) {
        match update {
            UploadUpdate::ChunkStored {
                attachment_id,
                index,
            } => {
                let Some(progress) = self.uploader.on_chunk_stored(attachment_id, index) else {
                    return;
                };
                if let Some(attachment) = self.uploader.get(attachment_id) {
                    self.publish(ChatEvent::UploadProgress {
                        attachment_id,
                        room_id: attachment.room_id.clone(),
                        progress,
                    });
                }
            }
            UploadUpdate::Finished {
                attachment_id,
                result: Ok(url),
            } => {
                let Some(attachment) = self.uploader.on_complete(attachment_id, url.clone()) else {
                    return;
                };
                let (room, local_id) = (attachment.room_id.clone(), attachment.local_id);
                tracing::info!(attachment_id = %attachment_id, room_id = %room, "upload complete");
                self.store.update_content(&room, local_id, &url);
                self.publish(ChatEvent::UploadComplete {
                    attachment_id,
                    room_id: room.clone(),
                    url,
                });
                self.publish(ChatEvent::TimelineChanged {
                    room_id: room.clone(),
                });
                if self.is_connected() {
                    self.spawn_send(&room, local_id);
                }
            }
            UploadUpdate::Finished {
                attachment_id,
                result: Err(e),
            } => {
                let error = ChatError::from_upload(attachment_id, e);
                tracing::warn!(error = %error, "upload failed");
                let reason = error.to_string();
                let Some(attachment) = self.uploader.on_failed(attachment_id, &reason) else {
                    return;
                };
                let (room, local_id) = (attachment.room_id.clone(), attachment.local_id);
                self.store.mark_failed(&room, local_id, &reason);
                self.publish(ChatEvent::UploadFailed {
                    attachment_id,
                    room_id: room.clone(),
                    reason: reason.clone(),
                });
                self.publish(ChatEvent::MessageFailed {
                    room_id: room.clone(),
                    local_id,
                    reason,
                });
                self.publish(ChatEvent::TimelineChanged { room_id: room });
            }
        }
    }

    // -- reads --------------------------------------------------------------

    fn spawn_read_receipt(&self, room: RoomId, up_to: Position) {
        let api = Arc::clone(&self.api);
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let result = api.mark_read(&room, up_to.message_id).await;
            let _ = tasks.send(TaskResult::ReadSent {
                room,
                up_to,
                result,
            });
        });
    }

    // -- session and server events ------------------------------------------

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                self.publish(ChatEvent::ConnectionChanged(state));
                if matches!(
                    state,
                    ConnectionState::Reconnecting | ConnectionState::Disconnected
                ) {
                    self.rooms.connection_lost();
                }
                if state == ConnectionState::Connected {
                    let effects = self.rooms.rejoin_all(Instant::now());
                    self.apply_room_effects(effects);
                    self.flush_pending();
                }
            }
            SessionEvent::Connected { user_id } => {
                self.presence.set_self(user_id.clone());
                self.user_id = Some(user_id);
            }
            SessionEvent::Reconnecting { attempt, .. } => {
                self.publish(ChatEvent::Reconnecting { attempt });
            }
            SessionEvent::AuthRejected { reason } => {
                self.publish(ChatEvent::AuthRejected { reason });
            }
            SessionEvent::ReconnectFailed => self.publish(ChatEvent::ReconnectFailed),
            SessionEvent::Server(event) => self.handle_server_event(event),
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        let now = Instant::now();
        match event {
            ServerEvent::Joined {
                room_id,
                ack,
                participants,
            } => {
                let effects = self.rooms.on_joined(&room_id, ack, participants, now);
                self.apply_room_effects(effects);
            }
            ServerEvent::JoinError {
                room_id,
                ack,
                reason,
            } => {
                let effects = self.rooms.on_join_error(&room_id, ack, &reason, now);
                self.apply_room_effects(effects);
            }
            ServerEvent::Message(message) => self.on_live_message(message, now),
            ServerEvent::Typing { room_id, user_id } => {
                if self.presence.on_typing(&room_id, &user_id, now) {
                    self.publish_typing(&room_id, now);
                }
            }
            ServerEvent::StopTyping { room_id, user_id } => {
                if self.presence.on_stop_typing(&room_id, &user_id, now) {
                    self.publish_typing(&room_id, now);
                }
            }
            ServerEvent::Read {
                room_id,
                user_id,
                message_id,
                created_at,
            } => {
                let up_to = Position {
                    created_at,
                    message_id,
                };
                if self.store.apply_read(&room_id, &user_id, up_to) > 0 {
                    self.publish(ChatEvent::TimelineChanged {
                        room_id: room_id.clone(),
                    });
                }
                if self.user_id.as_ref() == Some(&user_id)
                    && self.reads.apply_remote_read(&room_id, up_to)
                {
                    self.publish(ChatEvent::ReadStateChanged {
                        room_id: room_id.clone(),
                        state: self.reads.state(&room_id),
                    });
                }
                self.publish(ChatEvent::ReadBy {
                    room_id,
                    user_id,
                    up_to,
                });
            }
            ServerEvent::StatusChange { user_id, status } => {
                let rooms = self.presence.on_status(&user_id, status);
                self.publish(ChatEvent::PresenceChanged { user_id, status });
                for room in rooms {
                    self.publish_typing(&room, now);
                }
            }
            ServerEvent::Error { reason } => {
                tracing::warn!(reason = %reason, "server error event");
                self.publish(ChatEvent::ServerError { reason });
            }
            ServerEvent::AuthOk { .. } | ServerEvent::AuthError { .. } => {
                tracing::debug!("ignoring late auth reply");
            }
        }
    }

    fn on_live_message(&mut self, message: Message, now: Instant) {
        let room = message.room_id.clone();
        let sender = message.sender_id.clone();
        let position = message.position();
        match self.store.receive(message.clone()) {
            ReceiveOutcome::Inserted => {
                self.publish(ChatEvent::MessageReceived { message });
                self.publish(ChatEvent::TimelineChanged {
                    room_id: room.clone(),
                });
                if self.user_id.as_ref() == Some(&sender) {
                    return;
                }
                if self.presence.on_stop_typing(&room, &sender, now) {
                    self.publish_typing(&room, now);
                }
                let unread = match (position, self.reads.watermark(&room)) {
                    (Some(p), Some(w)) => p > w,
                    _ => true,
                };
                if unread {
                    if matches!(self.reads.state(&room), ReadState::Read(_)) {
                        self.reads.reset(&room);
                    }
                    if self.reads.mark_delivered(&room) {
                        self.publish(ChatEvent::ReadStateChanged {
                            room_id: room,
                            state: ReadState::Delivered,
                        });
                    }
                }
            }
            ReceiveOutcome::Confirmed(local_id) => {
                self.publish_confirmed(&room, local_id);
                self.publish(ChatEvent::TimelineChanged { room_id: room });
            }
            ReceiveOutcome::Duplicate | ReceiveOutcome::Ignored => {}
        }
    }

    fn publish_typing(&self, room: &RoomId, now: Instant) {
        self.publish(ChatEvent::TypingChanged {
            room_id: room.clone(),
            users: self.presence.typing_in(room, now),
        });
    }

    // -- background results and timer ---------------------------------------

    fn handle_task(&mut self, result: TaskResult) {
        match result {
            TaskResult::History {
                room,
                generation,
                latest,
                result,
            } => self.on_history(&room, generation, latest, result),
            TaskResult::Sent {
                room,
                local_id,
                result,
            } => self.on_sent(&room, local_id, result),
            TaskResult::SendRetryDue { room, local_id } => {
                self.in_flight_sends.remove(&local_id);
                if self.is_connected() {
                    self.spawn_send(&room, local_id);
                }
            }
            TaskResult::ReadSent {
                room,
                up_to,
                result,
            } => match result {
                Ok(ack) => {
                    tracing::debug!(room_id = %room, message_id = %ack.message_id, "read receipt stored");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(room_id = %room, error = %e, "read receipt failed, rescheduling");
                    self.reads.reschedule(&room, up_to, Instant::now());
                }
                Err(e) => {
                    tracing::warn!(room_id = %room, error = %e, "read receipt rejected");
                }
            },
            TaskResult::Upload(update) => self.on_upload(update),
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        let effects = self.rooms.expire(now);
        if !effects.is_empty() {
            self.apply_room_effects(effects);
        }
        for room in self.presence.expire(now) {
            self.publish_typing(&room, now);
        }
        for stop in self.throttle.tick(now) {
            self.emit(stop);
        }
        if self.is_connected() {
            for receipt in self.reads.flush_due(now) {
                self.spawn_read_receipt(receipt.room_id, receipt.up_to);
            }
        }
    }
}
