//! Message-bus seam.
//!
//! The control plane talks to agents through a key/value store with
//! list-queues and pub/sub channels. The core only needs four verbs; the
//! Redis implementation lives in [`redis`].

mod instruction;
pub mod redis;

pub use instruction::{Action, DiskSpec, InitOperate, InitOperateKind, Instruction};

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Append to the right end of a list queue.
    async fn rpush(&self, queue: &str, payload: String) -> Result<()>;

    /// Pop from the left end of a list queue; `None` when empty.
    async fn lpop(&self, queue: &str) -> Result<Option<String>>;

    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>>;
}

#[async_trait]
pub trait BusSubscription: Send {
    /// Next payload on the channel, or `None` if nothing arrived within
    /// `timeout`. Subscribe confirmations and other non-payload frames
    /// are filtered out by the implementation.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>>;
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-process bus for tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::broadcast;

    use super::{Bus, BusSubscription};
    use crate::errors::Result;

    #[derive(Default)]
    struct Inner {
        queues: HashMap<String, VecDeque<String>>,
        channels: HashMap<String, broadcast::Sender<String>>,
    }

    #[derive(Clone, Default)]
    pub struct MemoryBus {
        inner: Arc<Mutex<Inner>>,
    }

    impl MemoryBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue(&self, name: &str) -> Vec<String> {
            self.inner
                .lock()
                .queues
                .get(name)
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default()
        }

        pub fn push_front(&self, name: &str, payload: &str) {
            self.inner
                .lock()
                .queues
                .entry(name.to_string())
                .or_default()
                .push_front(payload.to_string());
        }

        fn sender(&self, channel: &str) -> broadcast::Sender<String> {
            self.inner
                .lock()
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .clone()
        }
    }

    #[async_trait]
    impl Bus for MemoryBus {
        async fn rpush(&self, queue: &str, payload: String) -> Result<()> {
            self.inner
                .lock()
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(payload);
            Ok(())
        }

        async fn lpop(&self, queue: &str) -> Result<Option<String>> {
            Ok(self
                .inner
                .lock()
                .queues
                .get_mut(queue)
                .and_then(|q| q.pop_front()))
        }

        async fn publish(&self, channel: &str, payload: String) -> Result<()> {
            let _ = self.sender(channel).send(payload);
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>> {
            Ok(Box::new(MemorySubscription {
                rx: self.sender(channel).subscribe(),
            }))
        }
    }

    pub struct MemorySubscription {
        rx: broadcast::Receiver<String>,
    }

    #[async_trait]
    impl BusSubscription for MemorySubscription {
        async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>> {
            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(Ok(msg)) => Ok(Some(msg)),
                Ok(Err(_)) => Ok(None),
                Err(_) => Ok(None),
            }
        }
    }
}
