//! Gaze exchange over a group overlay.
//!
//! The group node is not thread-safe, so it lives inside a single event-loop
//! task.  Everything else talks to that task through a control channel:
//!
//! ```text
//!   send() ──Publish(text)──▶ ┌──────────────┐ ──shout──▶ group
//!   stop() ──Stop───────────▶ │  event loop  │ ◀──events── group node
//!                             └──────┬───────┘
//!                                    ▼
//!                              PeerGazeTable
//! ```
//!
//! Own gaze is applied to the table locally as well as shouted, so a peer
//! sees itself in its own snapshot.  A peer's entry is removed when the
//! overlay reports it as gone (EXIT).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wayl_core::{GazeMessage, GazePosition, PeerGazeTable, SenderId};

use super::exchange::{apply_gaze_text, ExchangeError, GazeExchange, GazeSnapshot};
use crate::infrastructure::group::{GroupEvent, GroupEventKind, GroupNode};

/// Commands accepted by the group event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Shout this gaze text to the group and apply it locally.
    Publish(String),
    /// Leave the group and end the loop.
    Stop,
}

/// Group-overlay implementation of [`GazeExchange`].
pub struct GroupOverlayExchange<N: GroupNode + 'static> {
    group: String,
    local_id: SenderId,
    node: Mutex<Option<N>>,
    table: Arc<PeerGazeTable>,
    running: Arc<AtomicBool>,
    start_lock: tokio::sync::Mutex<()>,
    control: Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<N: GroupNode + 'static> GroupOverlayExchange<N> {
    /// Wraps `node`; it joins `group` when the exchange starts.
    pub fn new(node: N, group: &str) -> Self {
        let local_id = SenderId::new(node.uuid().to_string());
        Self {
            group: group.to_string(),
            local_id,
            node: Mutex::new(Some(node)),
            table: Arc::new(PeerGazeTable::new()),
            running: Arc::new(AtomicBool::new(false)),
            start_lock: tokio::sync::Mutex::new(()),
            control: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn control_sender(&self) -> Option<mpsc::UnboundedSender<ControlMessage>> {
        self.control.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl<N: GroupNode + 'static> GazeExchange for GroupOverlayExchange<N> {
    async fn start(&self) -> Result<(), ExchangeError> {
        let _guard = self.start_lock.lock().await;
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }
        let taken = self.node.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut node) = taken else {
            return Err(ExchangeError::Stopped);
        };

        node.join(&self.group);
        if let Err(e) = node.start().await {
            // Put the node back so a later start can retry.
            *self.node.lock().unwrap_or_else(|e| e.into_inner()) = Some(node);
            return Err(e.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.running.store(true, Ordering::Relaxed);
        let task = tokio::spawn(group_event_loop(
            node,
            self.group.clone(),
            rx,
            Arc::clone(&self.table),
            Arc::clone(&self.running),
        ));
        *self.control.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!("joined group {} as {}", self.group, self.local_id);
        Ok(())
    }

    async fn send(&self, position: GazePosition) -> Result<(), ExchangeError> {
        if !self.is_running() {
            self.start().await?;
        }
        let text = GazeMessage::new(self.local_id.clone(), position).to_wire();
        let sender = self.control_sender().ok_or(ExchangeError::Stopped)?;
        sender
            .send(ControlMessage::Publish(text))
            .map_err(|_| ExchangeError::Stopped)
    }

    fn read(&self) -> Result<GazeSnapshot, ExchangeError> {
        if !self.is_running() {
            return Err(ExchangeError::NotRunning);
        }
        Ok(self.table.snapshot())
    }

    fn local_id(&self) -> Option<SenderId> {
        Some(self.local_id.clone())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let sender = self.control.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(ControlMessage::Stop);
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("group event loop ended abnormally: {e}");
            }
        }
    }
}

impl<N: GroupNode + 'static> Drop for GroupOverlayExchange<N> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

enum Wake {
    Control(Option<ControlMessage>),
    Node(Option<GroupEvent>),
}

async fn group_event_loop<N: GroupNode>(
    mut node: N,
    group: String,
    mut control: mpsc::UnboundedReceiver<ControlMessage>,
    table: Arc<PeerGazeTable>,
    running: Arc<AtomicBool>,
) {
    loop {
        let wake = tokio::select! {
            message = control.recv() => Wake::Control(message),
            event = node.recv() => Wake::Node(event),
        };
        match wake {
            Wake::Control(None) | Wake::Control(Some(ControlMessage::Stop)) => break,
            Wake::Control(Some(ControlMessage::Publish(text))) => {
                apply_gaze_text(&table, &text);
                if let Err(e) = node.shout(&group, text.as_bytes()).await {
                    warn!("shout to {group} failed: {e}");
                }
            }
            Wake::Node(Some(event)) => handle_group_event(&table, event),
            Wake::Node(None) => {
                warn!("group node closed its event stream");
                break;
            }
        }
    }

    if let Err(e) = node.leave(&group).await {
        warn!("leaving {group} failed: {e}");
    }
    node.stop().await;
    running.store(false, Ordering::Relaxed);
    info!("left group {group}");
}

/// Applies one overlay event to the gaze table.
fn handle_group_event(table: &PeerGazeTable, event: GroupEvent) {
    match event.kind {
        GroupEventKind::Enter { headers } => {
            let headers = serde_json::to_string(&headers).unwrap_or_default();
            info!("peer {} ({}) entered, headers {headers}", event.name, event.peer);
        }
        GroupEventKind::Exit => {
            let removed = table.remove(&SenderId::new(event.peer.to_string()));
            info!("peer {} ({}) exited; entry cleared: {}", event.name, event.peer, removed.is_some());
        }
        GroupEventKind::Shout { payload, .. } => match String::from_utf8(payload) {
            Ok(text) => {
                apply_gaze_text(table, &text);
            }
            Err(_) => warn!("non-UTF-8 shout from {}", event.peer),
        },
        GroupEventKind::Whisper { .. } => debug!("ignoring whisper from {}", event.peer),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn event(peer: Uuid, kind: GroupEventKind) -> GroupEvent {
        GroupEvent {
            peer,
            name: "peer".into(),
            kind,
        }
    }

    #[test]
    fn test_shout_updates_table() {
        // Arrange
        let table = PeerGazeTable::new();
        let peer = Uuid::new_v4();
        let text = format!("{peer}:0.3,0.7");

        // Act
        handle_group_event(
            &table,
            event(
                peer,
                GroupEventKind::Shout {
                    group: "GAZE_EXCHANGE".into(),
                    payload: text.into_bytes(),
                },
            ),
        );

        // Assert
        assert_eq!(
            table.get(&SenderId::new(peer.to_string())),
            Some(GazePosition::new(0.3, 0.7).unwrap())
        );
    }

    #[test]
    fn test_exit_clears_peer_entry() {
        let table = PeerGazeTable::new();
        let peer = Uuid::new_v4();
        table.upsert(SenderId::new(peer.to_string()), GazePosition::new(0.5, 0.5).unwrap());

        handle_group_event(&table, event(peer, GroupEventKind::Exit));

        assert!(table.is_empty());
    }

    #[test]
    fn test_enter_and_whisper_leave_table_untouched() {
        let table = PeerGazeTable::new();
        let peer = Uuid::new_v4();
        handle_group_event(&table, event(peer, GroupEventKind::Enter { headers: HashMap::new() }));
        handle_group_event(
            &table,
            event(
                peer,
                GroupEventKind::Whisper {
                    payload: format!("{peer}:0.1,0.1").into_bytes(),
                },
            ),
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_malformed_shout_is_dropped() {
        let table = PeerGazeTable::new();
        handle_group_event(
            &table,
            event(
                Uuid::new_v4(),
                GroupEventKind::Shout {
                    group: "G".into(),
                    payload: vec![0xff, 0xfe],
                },
            ),
        );
        assert!(table.is_empty());
    }
}
