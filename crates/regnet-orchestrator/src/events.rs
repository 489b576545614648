//! "Blocks were mined" notifications.

use regnet_core::BitcoinNode;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

const CAPACITY: usize = 64;

/// Published after every successful mine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksMined {
    /// Number of blocks mined.
    pub blocks: u64,
    /// Node that mined them.
    pub node: BitcoinNode,
}

/// Broadcast channel for [`BlocksMined`].
#[derive(Debug, Clone)]
pub struct MineEvents {
    tx: broadcast::Sender<BlocksMined>,
}

impl Default for MineEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl MineEvents {
    /// Create a channel with no subscribers yet.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Notify every current subscriber. Having none is not an error.
    pub fn publish(&self, event: BlocksMined) {
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(receivers, "published blocks mined");
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> BroadcastStream<BlocksMined> {
        BroadcastStream::new(self.tx.subscribe())
    }
}
