//! External capabilities consumed by the pipeline.
//!
//! The pipeline treats each of these as an opaque, possibly slow remote
//! call. Implementations do pure I/O; dedup, batching and pooling live in
//! the stages.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::pipeline::types::{Message, MessageId, User};

pub use memory::{Fixture, InMemoryServices};

/// Resolves an address to a user record.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup_user(&self, address: &str) -> Result<User, ServiceError>;
}

/// Batched message retrieval for a set of users.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn fetch_messages(&self, users: &[User]) -> Result<Vec<Message>, ServiceError>;
}

/// Single-message spam classification.
#[async_trait]
pub trait SpamClassifier: Send + Sync {
    async fn is_spam(&self, id: MessageId) -> Result<bool, ServiceError>;
}

/// The three capabilities a full run needs.
#[derive(Clone)]
pub struct Services {
    pub users: Arc<dyn UserDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub classifier: Arc<dyn SpamClassifier>,
}

impl Services {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        messages: Arc<dyn MessageStore>,
        classifier: Arc<dyn SpamClassifier>,
    ) -> Self {
        Self {
            users,
            messages,
            classifier,
        }
    }

    /// Use one backend for all three capabilities.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserDirectory + MessageStore + SpamClassifier + 'static,
    {
        Self {
            users: backend.clone(),
            messages: backend.clone(),
            classifier: backend,
        }
    }
}
