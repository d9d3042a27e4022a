//! Fixture-backed implementation of all three external capabilities.
//!
//! Enforces the same limits a real backend would: a batch larger than
//! the configured size is rejected, and so is a classification call that
//! would exceed the configured concurrency. Call counters are exposed so
//! callers can check how the pipeline drove the backend.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{ConfigError, ServiceError};
use crate::pipeline::types::{Message, MessageId, User};
use crate::services::{MessageStore, SpamClassifier, UserDirectory};

// ── Fixture ─────────────────────────────────────────────────────────

/// JSON description of the users, mailboxes and spam verdicts to serve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub users: Vec<FixtureUser>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Ids of messages classified as spam.
    #[serde(default)]
    pub spam: Vec<MessageId>,
    /// Simulated latency applied to every call.
    #[serde(default)]
    pub latency_ms: u64,
}

/// A user plus any additional addresses that resolve to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureUser {
    pub id: u64,
    pub email: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Fixture {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(format!("fixture: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}

// ── Backend ─────────────────────────────────────────────────────────

/// In-memory user directory, message store and spam classifier.
#[derive(Debug)]
pub struct InMemoryServices {
    addresses: HashMap<String, User>,
    mailboxes: HashMap<u64, Vec<Message>>,
    known_messages: HashSet<MessageId>,
    spam: HashSet<MessageId>,
    latency: Duration,
    max_users_batch: Option<usize>,
    max_classify_requests: Option<usize>,
    lookup_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    classify_calls: AtomicUsize,
    classify_in_flight: AtomicUsize,
    classify_peak: AtomicUsize,
}

impl InMemoryServices {
    pub fn new(fixture: Fixture) -> Self {
        let mut addresses = HashMap::new();
        for entry in fixture.users {
            let user = User {
                id: entry.id,
                email: entry.email.clone(),
            };
            for alias in entry.aliases {
                addresses.insert(alias, user.clone());
            }
            addresses.insert(entry.email, user);
        }

        let mut mailboxes: HashMap<u64, Vec<Message>> = HashMap::new();
        let mut known_messages = HashSet::new();
        for message in fixture.messages {
            known_messages.insert(message.id);
            mailboxes.entry(message.owner).or_default().push(message);
        }

        Self {
            addresses,
            mailboxes,
            known_messages,
            spam: fixture.spam.into_iter().collect(),
            latency: Duration::from_millis(fixture.latency_ms),
            max_users_batch: None,
            max_classify_requests: None,
            lookup_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            classify_calls: AtomicUsize::new(0),
            classify_in_flight: AtomicUsize::new(0),
            classify_peak: AtomicUsize::new(0),
        }
    }

    /// Reject batches and classification bursts larger than `config` allows.
    pub fn with_limits(mut self, config: &PipelineConfig) -> Self {
        self.max_users_batch = Some(config.max_users_batch);
        self.max_classify_requests = Some(config.max_concurrent_classifications);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    /// Highest number of classification calls observed in flight at once.
    pub fn peak_classifications(&self) -> usize {
        self.classify_peak.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

/// Decrements the in-flight gauge when a call finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserDirectory for InMemoryServices {
    async fn lookup_user(&self, address: &str) -> Result<User, ServiceError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.addresses
            .get(address)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownAddress(address.to_string()))
    }
}

#[async_trait]
impl MessageStore for InMemoryServices {
    async fn fetch_messages(&self, users: &[User]) -> Result<Vec<Message>, ServiceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(max) = self.max_users_batch
            && users.len() > max
        {
            return Err(ServiceError::BatchTooLarge {
                size: users.len(),
                max,
            });
        }

        self.simulate_latency().await;

        let messages: Vec<Message> = users
            .iter()
            .filter_map(|user| self.mailboxes.get(&user.id))
            .flatten()
            .cloned()
            .collect();
        debug!(users = users.len(), messages = messages.len(), "Served message batch");
        Ok(messages)
    }
}

#[async_trait]
impl SpamClassifier for InMemoryServices {
    async fn is_spam(&self, id: MessageId) -> Result<bool, ServiceError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.classify_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.classify_in_flight);
        self.classify_peak.fetch_max(now, Ordering::SeqCst);

        if let Some(limit) = self.max_classify_requests
            && now > limit
        {
            return Err(ServiceError::TooManyRequests { limit });
        }

        self.simulate_latency().await;

        if !self.known_messages.contains(&id) {
            return Err(ServiceError::UnknownMessage(id));
        }
        Ok(self.spam.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use super::*;

    fn fixture() -> Fixture {
        Fixture::from_json(
            r#"{
                "users": [
                    {"id": 1, "email": "a@x", "aliases": ["alias@x"]},
                    {"id": 2, "email": "b@x"}
                ],
                "messages": [
                    {"id": 10, "owner": 1},
                    {"id": 11, "owner": 1},
                    {"id": 20, "owner": 2}
                ],
                "spam": [11]
            }"#,
        )
        .unwrap()
    }

    fn user(id: u64, email: &str) -> User {
        User {
            id,
            email: email.into(),
        }
    }

    #[tokio::test]
    async fn lookup_resolves_aliases_to_same_user() {
        let services = InMemoryServices::new(fixture());
        let direct = services.lookup_user("a@x").await.unwrap();
        let alias = services.lookup_user("alias@x").await.unwrap();
        assert_eq!(direct, alias);
        assert_eq!(services.lookup_calls(), 2);
    }

    #[tokio::test]
    async fn lookup_unknown_address_fails() {
        let services = InMemoryServices::new(fixture());
        let err = services.lookup_user("nobody@x").await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownAddress(ref a) if a == "nobody@x"));
    }

    #[tokio::test]
    async fn fetch_returns_messages_for_every_user() {
        let services = InMemoryServices::new(fixture());
        let messages = services
            .fetch_messages(&[user(1, "a@x"), user(2, "b@x")])
            .await
            .unwrap();
        let ids: Vec<u64> = messages.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![10, 11, 20]);
    }

    #[tokio::test]
    async fn fetch_rejects_oversized_batch() {
        let config = PipelineConfig::new(1, 5, 5).unwrap();
        let services = InMemoryServices::new(fixture()).with_limits(&config);
        let err = services
            .fetch_messages(&[user(1, "a@x"), user(2, "b@x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::BatchTooLarge { size: 2, max: 1 }));
    }

    #[tokio::test]
    async fn classify_reports_spam_verdicts() {
        let services = InMemoryServices::new(fixture());
        assert!(services.is_spam(MessageId(11)).await.unwrap());
        assert!(!services.is_spam(MessageId(10)).await.unwrap());
        assert!(matches!(
            services.is_spam(MessageId(99)).await,
            Err(ServiceError::UnknownMessage(MessageId(99)))
        ));
    }

    #[tokio::test]
    async fn classify_rejects_calls_over_the_limit() {
        let config = PipelineConfig::new(2, 1, 5).unwrap();
        let services = Arc::new(
            InMemoryServices::new(fixture())
                .with_limits(&config)
                .with_latency(Duration::from_millis(50)),
        );

        let first = {
            let services = Arc::clone(&services);
            tokio::spawn(async move { services.is_spam(MessageId(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = services.is_spam(MessageId(11)).await;

        assert!(matches!(second, Err(ServiceError::TooManyRequests { limit: 1 })));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(services.peak_classifications(), 2);
    }

    #[test]
    fn fixture_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"users": [{{"id": 3, "email": "c@x"}}], "latency_ms": 5}}"#
        )
        .unwrap();

        let fixture = Fixture::load(file.path()).unwrap();
        assert_eq!(fixture.users.len(), 1);
        assert_eq!(fixture.latency_ms, 5);
        assert!(fixture.messages.is_empty());
    }

    #[test]
    fn fixture_rejects_malformed_json() {
        let err = Fixture::from_json("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
