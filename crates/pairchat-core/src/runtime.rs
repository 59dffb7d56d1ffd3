//! Tokio driver for the engine, using the mpsc command/notification pattern.
//!
//! The engine runs inside one dedicated task. Host code talks to it through
//! an [`EngineHandle`] (commands with oneshot replies) and receives
//! [`EngineEvent`]s on a notification channel. Transport events, presence
//! snapshots, fired timers and relay batches are multiplexed into the same
//! loop, so the engine only ever sees one input at a time.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use pairchat_net::{PendingMessage, Snapshot, TransportEvent};
use pairchat_shared::message::{Content, Message, MessageId};
use pairchat_shared::types::PeerAddress;
use pairchat_store::FriendRecord;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::events::{ConversationKey, EngineEvent};
use crate::scheduler::Timer;
use crate::session::SessionState;

/// Install a `tracing` subscriber honouring `RUST_LOG`. Safe to call twice.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("pairchat_core=debug,pairchat_net=debug,pairchat_store=info,warn")
    });
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}

type Reply<T> = oneshot::Sender<Result<T>>;

// ---------------------------------------------------------------------------
// Command / input types
// ---------------------------------------------------------------------------

/// Commands sent *into* the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    Connect(Reply<()>),
    Cancel(Reply<()>),
    Disconnect(Reply<()>),
    StartOver(Reply<()>),
    Reset(Reply<()>),
    SendMessage {
        conversation: ConversationKey,
        content: Content,
        reply_to: Option<MessageId>,
        reply: Reply<MessageId>,
    },
    SetTyping {
        conversation: ConversationKey,
        active: bool,
        reply: Reply<()>,
    },
    SetRecording {
        conversation: ConversationKey,
        active: bool,
        reply: Reply<()>,
    },
    React {
        conversation: ConversationKey,
        message_id: MessageId,
        emoji: String,
        reply: Reply<()>,
    },
    EditMessage {
        message_id: MessageId,
        text: String,
        reply: Reply<()>,
    },
    SetVanishMode(bool, Reply<()>),
    SendFriendRequest(ConversationKey, Reply<()>),
    AcceptFriendRequest(String, Reply<FriendRecord>),
    RemoveFriend(String, oneshot::Sender<bool>),
    OpenSecondary(PeerAddress, Reply<()>),
    CloseSecondary(PeerAddress, Reply<()>),
    GetState(oneshot::Sender<SessionState>),
    GetVisibleMessages(ConversationKey, oneshot::Sender<Vec<Message>>),
    /// Close every link, leave the directory and stop the task.
    Shutdown,
}

/// Input streams multiplexed by the engine task.
pub struct EngineInputs {
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub presence: watch::Receiver<Snapshot>,
    pub timers: mpsc::UnboundedReceiver<Timer>,
    pub relay: Option<mpsc::Receiver<Vec<PendingMessage>>>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable host-side handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn connect(&self) -> Result<()> {
        self.request(EngineCommand::Connect).await?
    }

    pub async fn cancel(&self) -> Result<()> {
        self.request(EngineCommand::Cancel).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(EngineCommand::Disconnect).await?
    }

    pub async fn start_over(&self) -> Result<()> {
        self.request(EngineCommand::StartOver).await?
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(EngineCommand::Reset).await?
    }

    pub async fn send_message(
        &self,
        conversation: ConversationKey,
        content: Content,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        self.request(|reply| EngineCommand::SendMessage {
            conversation,
            content,
            reply_to,
            reply,
        })
        .await?
    }

    pub async fn set_typing(&self, conversation: ConversationKey, active: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetTyping {
            conversation,
            active,
            reply,
        })
        .await?
    }

    pub async fn set_recording(&self, conversation: ConversationKey, active: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetRecording {
            conversation,
            active,
            reply,
        })
        .await?
    }

    pub async fn react(
        &self,
        conversation: ConversationKey,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<()> {
        let emoji = emoji.into();
        self.request(|reply| EngineCommand::React {
            conversation,
            message_id,
            emoji,
            reply,
        })
        .await?
    }

    pub async fn edit_message(&self, message_id: MessageId, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| EngineCommand::EditMessage {
            message_id,
            text,
            reply,
        })
        .await?
    }

    pub async fn set_vanish_mode(&self, enabled: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetVanishMode(enabled, reply))
            .await?
    }

    pub async fn send_friend_request(&self, conversation: ConversationKey) -> Result<()> {
        self.request(|reply| EngineCommand::SendFriendRequest(conversation, reply))
            .await?
    }

    pub async fn accept_friend_request(&self, key: impl Into<String>) -> Result<FriendRecord> {
        let key = key.into();
        self.request(|reply| EngineCommand::AcceptFriendRequest(key, reply))
            .await?
    }

    pub async fn remove_friend(&self, key: impl Into<String>) -> Result<bool> {
        let key = key.into();
        self.request(|reply| EngineCommand::RemoveFriend(key, reply))
            .await
    }

    pub async fn open_secondary(&self, peer: PeerAddress) -> Result<()> {
        self.request(|reply| EngineCommand::OpenSecondary(peer, reply))
            .await?
    }

    pub async fn close_secondary(&self, peer: PeerAddress) -> Result<()> {
        self.request(|reply| EngineCommand::CloseSecondary(peer, reply))
            .await?
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.request(EngineCommand::GetState).await
    }

    pub async fn visible_messages(&self, conversation: ConversationKey) -> Result<Vec<Message>> {
        self.request(|reply| EngineCommand::GetVisibleMessages(conversation, reply))
            .await
    }

    /// Ask the task to shut down. Returns once the command is queued.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the engine event loop in a background tokio task.
///
/// Returns the command handle, the notification receiver and the task
/// handle. The task ends on [`EngineCommand::Shutdown`] or once every
/// handle is dropped.
pub fn spawn_engine(
    mut engine: Engine,
    inputs: EngineInputs,
) -> (EngineHandle, mpsc::Receiver<EngineEvent>, JoinHandle<()>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<EngineCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<EngineEvent>(256);

    let EngineInputs {
        transport: mut transport_rx,
        presence: mut presence_rx,
        timers: mut timer_rx,
        relay: mut relay_rx,
    } = inputs;

    let task = tokio::spawn(async move {
        engine.start();
        let initial = presence_rx.borrow_and_update().clone();
        engine.on_presence_snapshot(initial);
        flush(&mut engine, &notif_tx).await;

        let mut transport_open = true;
        let mut presence_open = true;

        loop {
            tokio::select! {
                // --- Host commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Shutdown) => {
                            info!("Engine shutdown requested");
                            break;
                        }
                        Some(cmd) => apply(&mut engine, cmd),
                        None => {
                            info!("Command channel closed, stopping engine");
                            break;
                        }
                    }
                }

                // --- Transport lifecycle ---
                event = transport_rx.recv(), if transport_open => {
                    match event {
                        Some(event) => engine.on_transport_event(event),
                        None => {
                            transport_open = false;
                            engine.on_transport_lost("transport event channel closed");
                        }
                    }
                }

                // --- Presence snapshots ---
                changed = presence_rx.changed(), if presence_open => {
                    match changed {
                        Ok(()) => {
                            let snapshot = presence_rx.borrow_and_update().clone();
                            engine.on_presence_snapshot(snapshot);
                        }
                        Err(_) => {
                            debug!("Presence directory gone");
                            presence_open = false;
                        }
                    }
                }

                // --- Timers ---
                Some(timer) = timer_rx.recv() => engine.on_timer(timer),

                // --- Offline relay ---
                batch = next_batch(&mut relay_rx) => {
                    match batch {
                        Some(batch) => engine.on_relay_messages(batch),
                        None => relay_rx = None,
                    }
                }
            }

            flush(&mut engine, &notif_tx).await;
        }

        engine.shutdown();
        flush(&mut engine, &notif_tx).await;
    });

    (EngineHandle { commands: cmd_tx }, notif_rx, task)
}

async fn next_batch(
    relay: &mut Option<mpsc::Receiver<Vec<PendingMessage>>>,
) -> Option<Vec<PendingMessage>> {
    match relay {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn flush(engine: &mut Engine, notif_tx: &mpsc::Sender<EngineEvent>) {
    for event in engine.drain_events() {
        if notif_tx.send(event).await.is_err() {
            break;
        }
    }
}

fn apply(engine: &mut Engine, cmd: EngineCommand) {
    match cmd {
        EngineCommand::Connect(reply) => {
            let _ = reply.send(engine.connect());
        }
        EngineCommand::Cancel(reply) => {
            let _ = reply.send(engine.cancel());
        }
        EngineCommand::Disconnect(reply) => {
            let _ = reply.send(engine.disconnect());
        }
        EngineCommand::StartOver(reply) => {
            let _ = reply.send(engine.start_over());
        }
        EngineCommand::Reset(reply) => {
            let _ = reply.send(engine.reset());
        }
        EngineCommand::SendMessage {
            conversation,
            content,
            reply_to,
            reply,
        } => {
            let _ = reply.send(engine.send_message(&conversation, content, reply_to.as_deref()));
        }
        EngineCommand::SetTyping {
            conversation,
            active,
            reply,
        } => {
            let _ = reply.send(engine.set_typing(&conversation, active));
        }
        EngineCommand::SetRecording {
            conversation,
            active,
            reply,
        } => {
            let _ = reply.send(engine.set_recording(&conversation, active));
        }
        EngineCommand::React {
            conversation,
            message_id,
            emoji,
            reply,
        } => {
            let _ = reply.send(engine.react(&conversation, &message_id, &emoji));
        }
        EngineCommand::EditMessage {
            message_id,
            text,
            reply,
        } => {
            let _ = reply.send(engine.edit_message(&message_id, &text));
        }
        EngineCommand::SetVanishMode(enabled, reply) => {
            let _ = reply.send(engine.set_vanish_mode(enabled));
        }
        EngineCommand::SendFriendRequest(conversation, reply) => {
            let _ = reply.send(engine.send_friend_request(&conversation));
        }
        EngineCommand::AcceptFriendRequest(key, reply) => {
            let _ = reply.send(engine.accept_friend_request(&key));
        }
        EngineCommand::RemoveFriend(key, reply) => {
            let _ = reply.send(engine.remove_friend(&key));
        }
        EngineCommand::OpenSecondary(peer, reply) => {
            let _ = reply.send(engine.open_secondary(&peer));
        }
        EngineCommand::CloseSecondary(peer, reply) => {
            let _ = reply.send(engine.close_secondary(&peer));
        }
        EngineCommand::GetState(reply) => {
            let _ = reply.send(engine.state());
        }
        EngineCommand::GetVisibleMessages(conversation, reply) => {
            let _ = reply.send(engine.visible_messages(&conversation));
        }
        EngineCommand::Shutdown => {}
    }
}
