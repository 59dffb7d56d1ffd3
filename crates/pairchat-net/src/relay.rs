//! Offline relay pull.
//!
//! Messages addressed to this identity while it was unreachable are queued
//! by an external store-and-forward relay. The poller pulls them once at
//! startup and then on a fixed interval, forwarding each non-empty batch.
//! Deduplication against already-seen ids is left to the consumer.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;

/// One queued message as served by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub id: String,
    pub sender_id: String,
    /// Content variant tag: `text`, `image` or `audio`.
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Client side of the relay polling contract.
pub trait RelayClient: Send + Sync + 'static {
    fn fetch_pending(
        &self,
        identity: &str,
    ) -> impl Future<Output = Result<Vec<PendingMessage>>> + Send;
}

/// HTTP relay client: `GET {base_url}/pending/{identity}` returning a JSON array.
#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn pending_url(&self, identity: &str) -> String {
        format!("{}/pending/{}", self.base_url, identity)
    }
}

impl RelayClient for HttpRelayClient {
    fn fetch_pending(
        &self,
        identity: &str,
    ) -> impl Future<Output = Result<Vec<PendingMessage>>> + Send {
        let request = self.http.get(self.pending_url(identity));
        async move {
            let messages = request
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<PendingMessage>>()
                .await?;
            Ok(messages)
        }
    }
}

/// Spawn the relay poller as a background tokio task.
///
/// The first poll happens immediately. Fetch errors are logged and the next
/// tick retries. The task ends once the receiving side of `batches` is gone.
pub fn spawn_relay_poller<C: RelayClient>(
    client: C,
    identity: String,
    interval: Duration,
    batches: mpsc::Sender<Vec<PendingMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(identity = %identity, every = ?interval, "Offline relay poller started");

        loop {
            ticker.tick().await;
            match client.fetch_pending(&identity).await {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    debug!(count = messages.len(), "Pulled pending relay messages");
                    if batches.send(messages).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Offline relay poll failed");
                }
            }
            if batches.is_closed() {
                break;
            }
        }

        info!("Offline relay poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::NetError;

    #[derive(Clone, Default)]
    struct ScriptedRelay {
        replies: Arc<Mutex<VecDeque<Result<Vec<PendingMessage>>>>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RelayClient for ScriptedRelay {
        fn fetch_pending(
            &self,
            identity: &str,
        ) -> impl Future<Output = Result<Vec<PendingMessage>>> + Send {
            self.calls.lock().unwrap().push(identity.to_string());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
            async move { reply }
        }
    }

    fn pending(id: &str) -> PendingMessage {
        PendingMessage {
            id: id.to_string(),
            sender_id: "friend-1".to_string(),
            kind: "text".to_string(),
            content: "while you were away".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_at_startup_then_on_interval() {
        let relay = ScriptedRelay::default();
        relay.replies.lock().unwrap().extend([
            Ok(vec![pending("r-1")]),
            Err(NetError::InvalidAddress("relay down".into())),
            Ok(vec![pending("r-2"), pending("r-3")]),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_relay_poller(relay.clone(), "me".into(), Duration::from_secs(15), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first[0].id, "r-1");

        // The failing poll is skipped; the third one delivers.
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(relay.calls.lock().unwrap().len(), 3);
        assert!(relay.calls.lock().unwrap().iter().all(|id| id == "me"));

        drop(rx);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_finished());
    }

    #[test]
    fn test_pending_message_wire_shape() {
        let json = r#"{"id":"r-9","senderId":"s","type":"image","content":"data:..","createdAt":"2024-01-01T00:00:00Z"}"#;
        let msg: PendingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, "image");
        assert_eq!(msg.sender_id, "s");
    }

    #[test]
    fn test_pending_url() {
        let client = HttpRelayClient::new("https://relay.example/");
        assert_eq!(client.pending_url("abc"), "https://relay.example/pending/abc");
    }
}
