use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_db::Database;
use huddle_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::store::{self, NewMessage};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one authenticated WebSocket connection. The token was already
/// validated at the HTTP upgrade, so the user is known before admission.
///
/// Lifecycle: admit into the registry (superseding any earlier connection),
/// subscribe to every group the user belongs to, pump events out and
/// commands in, and release on the way out. A release after supersession is
/// a no-op, so a slow teardown can never evict the newer connection.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
) {
    let (tx, mut event_rx) = mpsc::unbounded_channel();
    let conn_id = dispatcher.admit(user_id, tx).await;

    // Subscribe to every room the user holds a membership in.
    let db_for_groups = db.clone();
    let uid = user_id.to_string();
    let groups = tokio::task::spawn_blocking(move || db_for_groups.group_ids_for_user(&uid)).await;
    match groups {
        Ok(Ok(group_ids)) => {
            for raw in group_ids {
                match raw.parse::<Uuid>() {
                    Ok(group_id) => dispatcher.rooms().subscribe(group_id, user_id).await,
                    Err(e) => warn!("Corrupt group id '{}' for {}: {}", raw, user_id, e),
                }
            }
        }
        Ok(Err(e)) => {
            warn!("Failed to load groups for {}: {}", user_id, e);
            dispatcher.release(user_id, conn_id).await;
            return;
        }
        Err(e) => {
            warn!("spawn_blocking join error: {}", e);
            dispatcher.release(user_id, conn_id).await;
            return;
        }
    }

    info!("{} ({}) connected to gateway", username, user_id);

    let (mut sender, mut receiver) = socket.split();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = event_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &db_recv, user_id, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.release(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn handle_command(dispatcher: &Dispatcher, db: &Arc<Database>, user_id: Uuid, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::SendMessage {
            group_id,
            text,
            reply_id,
        } => {
            let db = db.clone();
            let stored = tokio::task::spawn_blocking(move || {
                store::persist_message(&db, NewMessage::chat(&text, user_id, group_id, reply_id))
            })
            .await;

            match stored {
                Ok(Ok(stored)) => {
                    // The write is durable; now fan out to everyone else in
                    // the room. The sender keeps their local copy.
                    dispatcher
                        .to_room_except(
                            group_id,
                            GatewayEvent::NewMessage(stored.payload_for(None)),
                            user_id,
                        )
                        .await;
                }
                Ok(Err(e)) => {
                    dispatcher
                        .to_user(user_id, GatewayEvent::Error { message: e.to_string() })
                        .await;
                }
                Err(e) => warn!("spawn_blocking join error: {}", e),
            }
        }

        // The client names a group, but the stored row is authoritative for
        // where the removal gets announced.
        GatewayCommand::DeleteMessage { message_id, group_id: _ } => {
            let db = db.clone();
            let deleted =
                tokio::task::spawn_blocking(move || store::delete_message(&db, message_id, user_id))
                    .await;

            match deleted {
                Ok(Ok(stored_group)) => {
                    if let Some(group_id) = stored_group {
                        dispatcher
                            .to_room(group_id, GatewayEvent::DeleteMessage { message_id, group_id })
                            .await;
                    }
                }
                Ok(Err(e)) => {
                    dispatcher
                        .to_user(user_id, GatewayEvent::Error { message: e.to_string() })
                        .await;
                }
                Err(e) => warn!("spawn_blocking join error: {}", e),
            }
        }
    }
}
