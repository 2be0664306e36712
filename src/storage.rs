//! Pluggable durable storage.
//!
//! The broker loads retained messages on start and saves them whenever the table changes. The
//! managed client saves the publications it holds while disconnected. Implementations may be
//! slow; they are never called while a lock is held.
use crate::{publication::ApplicationMessage, Error};
use async_trait::async_trait;
use parking_lot::Mutex;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_queued_messages(&self) -> Result<Vec<ApplicationMessage>, Error>;

    async fn save_queued_messages(&self, messages: Vec<ApplicationMessage>) -> Result<(), Error>;

    async fn load_retained_messages(&self) -> Result<Vec<ApplicationMessage>, Error>;

    async fn save_retained_messages(&self, messages: Vec<ApplicationMessage>)
        -> Result<(), Error>;
}

/// A reference [Storage] keeping everything in memory.
#[derive(Default)]
pub struct MemoryStorage {
    queued: Mutex<Vec<ApplicationMessage>>,
    retained: Mutex<Vec<ApplicationMessage>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_queued_messages(&self) -> Result<Vec<ApplicationMessage>, Error> {
        Ok(self.queued.lock().clone())
    }

    async fn save_queued_messages(&self, messages: Vec<ApplicationMessage>) -> Result<(), Error> {
        *self.queued.lock() = messages;
        Ok(())
    }

    async fn load_retained_messages(&self) -> Result<Vec<ApplicationMessage>, Error> {
        Ok(self.retained.lock().clone())
    }

    async fn save_retained_messages(
        &self,
        messages: Vec<ApplicationMessage>,
    ) -> Result<(), Error> {
        *self.retained.lock() = messages;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.load_queued_messages().await.unwrap().is_empty());

        let messages = vec![ApplicationMessage::new("a", "1"), ApplicationMessage::new("b", "2")];
        storage.save_queued_messages(messages.clone()).await.unwrap();
        storage
            .save_retained_messages(messages[..1].to_vec())
            .await
            .unwrap();

        assert_eq!(storage.load_queued_messages().await.unwrap(), messages);
        assert_eq!(storage.load_retained_messages().await.unwrap().len(), 1);
    }
}
