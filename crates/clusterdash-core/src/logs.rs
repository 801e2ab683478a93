// ── Log tailing ──
//
// A log stream is append-only text, not entities: every inbound chunk is
// pushed onto a bounded history, oldest dropped first.

use std::collections::VecDeque;
use std::sync::Arc;

use clusterdash_api::{ChannelState, ControlMessage, ReconnectConfig, SubscriptionChannel, TokenStore};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

/// Retained chunks of one container's log.
#[derive(Debug, Clone, Default)]
pub struct LogHistory {
    chunks: VecDeque<Arc<str>>,
    /// Chunks received since the tail opened, including dropped ones.
    total: u64,
}

impl LogHistory {
    pub fn latest(&self) -> Option<&Arc<str>> {
        self.chunks.back()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Arc<str>> {
        self.chunks.iter()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn push(&mut self, chunk: Arc<str>, limit: usize) {
        while self.chunks.len() >= limit.max(1) {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
        self.total += 1;
    }

    /// Retained chunks numbered above `seen`.
    fn since(&self, seen: u64) -> Vec<Arc<str>> {
        let fresh = usize::try_from(self.total.saturating_sub(seen)).unwrap_or(usize::MAX);
        let skip = self.chunks.len().saturating_sub(fresh);
        self.chunks.iter().skip(skip).cloned().collect()
    }
}

/// Follows `<base>/logs` for one container.
#[derive(Debug)]
pub struct LogTail {
    container: String,
    channel: SubscriptionChannel,
    history: watch::Receiver<LogHistory>,
    seen: u64,
}

impl LogTail {
    /// Open the stream. `limit` bounds the retained history.
    pub fn open(
        url: Url,
        container: impl Into<String>,
        limit: usize,
        reconnect: ReconnectConfig,
        tokens: TokenStore,
        parent: &CancellationToken,
    ) -> Self {
        let container = container.into();
        let handshake = ControlMessage::new("get_logs")
            .with_field("container", container.clone())
            .with_field("follow", true);
        let (channel, mut frames) = SubscriptionChannel::open(url, handshake, reconnect, tokens, parent);
        let (history_tx, history_rx) = watch::channel(LogHistory::default());

        let name = container.clone();
        tokio::spawn(async move {
            while let Some(chunk) = frames.recv().await {
                trace!(container = %name, len = chunk.len(), "log chunk");
                let chunk: Arc<str> = Arc::from(chunk);
                history_tx.send_modify(|history| history.push(chunk, limit));
            }
            debug!(container = %name, "log stream ended");
        });

        Self {
            container,
            channel,
            history: history_rx,
            seen: 0,
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn latest(&self) -> Option<Arc<str>> {
        self.history.borrow().latest().cloned()
    }

    pub fn history(&self) -> Vec<Arc<str>> {
        self.history.borrow().chunks().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<LogHistory> {
        self.history.clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Wait for chunks this handle has not returned yet. Chunks that fell
    /// out of the history in between are skipped. `None` once the stream
    /// has ended.
    pub async fn next_chunks(&mut self) -> Option<Vec<Arc<str>>> {
        loop {
            {
                let history = self.history.borrow_and_update();
                if history.total() > self.seen {
                    let fresh = history.since(self.seen);
                    self.seen = history.total();
                    return Some(fresh);
                }
            }
            self.history.changed().await.ok()?;
        }
    }

    /// Close the socket. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.channel.close()
    }
}
