//! `studychat`: a line-oriented client for the chat core.
//!
//! Joins one room and prints its timeline. Plain lines are sent as
//! messages; a few slash commands cover the rest.
//!
//! ```bash
//! cargo run --bin studychat -- --server-url http://127.0.0.1:9000 \
//!     --token alice-token --room math
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

use studychat::api::HttpChatApi;
use studychat::chat::{ChatEvent, ChatHandle, OutgoingFile};
use studychat::config::{CliArgs, ClientConfig};
use studychat::transport::ws::WsTransport;
use studychat::{ChatClient, ChatError};
use studychat_proto::ids::{RoomId, Timestamp};
use studychat_proto::message::{Message, MessageKind};

const HELP: &str = "commands: /history  /search <word>  /upload <path>  /who  /info  /leave  /quit";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("studychat starting");

    match run(config).await {
        Ok(()) => {
            tracing::info!("studychat exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            tracing::error!(error = %e, "studychat failed");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging so log lines never mix with the chat on
/// stdout. The returned guard flushes buffered entries on drop.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("studychat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: ClientConfig) -> Result<(), ChatError> {
    let token = config
        .token
        .clone()
        .ok_or_else(|| ChatError::Auth("no token configured (use --token)".to_string()))?;
    let room = RoomId::new(
        config
            .room
            .clone()
            .ok_or_else(|| ChatError::NotFound("no room configured (use --room)".to_string()))?,
    );

    let api = HttpChatApi::new(config.api_url()?, token.clone(), config.network.request_timeout)?;
    let transport = WsTransport::new(
        config.socket_url()?.as_str(),
        config.network.connect_timeout,
        config.network.channel_capacity,
    );
    let format = config.timestamp_format.clone();

    let chat = ChatClient::start(api, transport, token, config);
    let printer = tokio::spawn(print_events(chat.subscribe(), format.clone()));

    println!("joining {room}...");
    chat.join_room(&room).await?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(&chat, &room, line, &format).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {e}"),
        }
    }

    printer.abort();
    chat.shutdown().await;
    Ok(())
}

/// Handle one input line. Returns `false` to quit.
async fn handle_line(
    chat: &ChatHandle,
    room: &RoomId,
    line: &str,
    format: &str,
) -> Result<bool, ChatError> {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/quit" => return Ok(false),
        "/leave" => {
            chat.leave_room(room).await?;
            return Ok(false);
        }
        "/history" => {
            let load = chat.load_older(room).await?;
            let tail = if load.has_more { "" } else { " (start of room)" };
            println!("-- {} older messages{tail}", load.inserted);
        }
        "/search" => {
            for message in chat.search(room, arg.trim()).await? {
                println!("{}", render(&message, format));
            }
        }
        "/upload" => {
            let path = Path::new(arg.trim());
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| ChatError::NotFound(format!("{}: {e}", path.display())))?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string();
            let file = OutgoingFile {
                mime_type: mime_for(&file_name).to_string(),
                file_name,
                bytes,
            };
            let id = chat.upload(room, file).await?;
            println!("-- uploading {id}");
        }
        "/info" => {
            let summary = chat.get_room(room).await?;
            let members: Vec<String> = summary.participants.iter().map(ToString::to_string).collect();
            println!("-- {} ({}): {}", summary.name, summary.room_id, members.join(", "));
        }
        "/who" => {
            let typing = chat.typing_in(room).await?;
            if !typing.is_empty() {
                let names: Vec<String> = typing.iter().map(ToString::to_string).collect();
                println!("-- typing: {}", names.join(", "));
            }
        }
        _ if command.starts_with('/') => println!("{HELP}"),
        _ => {
            chat.typing(room).await;
            chat.send_message(room, line).await?;
            chat.mark_read(room, None).await?;
        }
    }
    Ok(true)
}

async fn print_events(mut events: broadcast::Receiver<ChatEvent>, format: String) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ChatEvent::MessageReceived { message } => println!("{}", render(&message, &format)),
            ChatEvent::ConnectionChanged(state) => println!("-- {state}"),
            ChatEvent::Reconnecting { attempt } => println!("-- reconnecting (attempt {attempt})"),
            ChatEvent::ReconnectFailed => println!("-- gave up reconnecting"),
            ChatEvent::AuthRejected { reason } => println!("-- login rejected: {reason}"),
            ChatEvent::RoomJoined { room_id, participants } => {
                println!("-- joined {room_id} ({} here)", participants.len());
            }
            ChatEvent::JoinFailed { room_id, reason } => println!("-- could not join {room_id}: {reason}"),
            ChatEvent::MessageFailed { reason, .. } => println!("-- message not sent: {reason}"),
            ChatEvent::PresenceChanged { user_id, status } => println!("-- {user_id} is {status}"),
            ChatEvent::ReadBy { user_id, up_to, .. } => {
                tracing::debug!(user = %user_id, up_to = %up_to, "read receipt");
            }
            ChatEvent::UploadComplete { url, .. } => println!("-- uploaded {url}"),
            ChatEvent::UploadFailed { reason, .. } => println!("-- upload failed: {reason}"),
            ChatEvent::ServerError { reason } => println!("-- server: {reason}"),
            _ => {}
        }
    }
}

fn render(message: &Message, format: &str) -> String {
    let when = local_time(message.created_at, format);
    match message.kind {
        MessageKind::Text => format!("[{when}] {}: {}", message.sender_id, message.content),
        kind => format!("[{when}] {} sent {kind}: {}", message.sender_id, message.content),
    }
}

fn local_time(at: Timestamp, format: &str) -> String {
    i64::try_from(at.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || at.to_string(),
            |utc| utc.with_timezone(&chrono::Local).format(format).to_string(),
        )
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
