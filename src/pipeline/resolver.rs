//! `SelectUsers` — resolves addresses to users, dropping duplicates.
//!
//! Every address gets its own lookup task, bounded by a semaphore. The
//! "seen identities" set is locked only around the check-and-insert, never
//! across the lookup or the send, so lookups overlap freely.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::pipeline::conduit::{Inbound, Outbound};
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::User;
use crate::services::UserDirectory;

/// Resolver stage: `String` addresses in, unique `User`s out.
pub struct SelectUsers {
    directory: Arc<dyn UserDirectory>,
    max_concurrent_lookups: usize,
}

impl SelectUsers {
    pub fn new(directory: Arc<dyn UserDirectory>, max_concurrent_lookups: usize) -> Self {
        Self {
            directory,
            max_concurrent_lookups: max_concurrent_lookups.max(1),
        }
    }
}

#[async_trait]
impl Stage for SelectUsers {
    type Input = String;
    type Output = User;

    fn name(&self) -> &'static str {
        "select_users"
    }

    async fn run(
        &self,
        ctx: StageContext,
        mut input: Inbound<String>,
        output: Outbound<User>,
    ) -> Result<(), PipelineError> {
        let permits = Arc::new(Semaphore::new(self.max_concurrent_lookups));
        let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut lookups = JoinSet::new();
        let mut addresses = 0usize;

        info!(
            max_concurrent = self.max_concurrent_lookups,
            "Resolving users"
        );

        loop {
            // A failed lookup ends the stage even while upstream is idle.
            let address = tokio::select! {
                Some(joined) = lookups.join_next(), if !lookups.is_empty() => {
                    check_lookup(joined)?;
                    continue;
                }
                next = input.recv() => match next? {
                    Some(address) => address,
                    None => break,
                },
            };
            addresses += 1;

            let permit = tokio::select! {
                biased;
                _ = ctx.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.map_err(|e| PipelineError::TaskFailed(e.to_string()))?
                }
            };

            let directory = Arc::clone(&self.directory);
            let seen = Arc::clone(&seen);
            let output = output.clone();
            let ctx = ctx.clone();
            lookups.spawn(async move {
                let user = ctx
                    .call("lookup_user", directory.lookup_user(&address), |source| {
                        PipelineError::Lookup {
                            address: address.clone(),
                            source,
                        }
                    })
                    .await;
                drop(permit);
                let user = user?;

                if !first_sighting(&seen, &user.email) {
                    debug!(address = %address, email = %user.email, "Dropping duplicate user");
                    return Ok(());
                }
                output.send(user).await
            });
        }

        while let Some(joined) = lookups.join_next().await {
            check_lookup(joined)?;
        }

        info!(
            addresses,
            users = lock_seen(&seen).len(),
            "Resolved users"
        );
        Ok(())
    }
}

/// Record `email` as forwarded; `false` if it already was.
fn first_sighting(seen: &Mutex<HashSet<String>>, email: &str) -> bool {
    let mut seen = lock_seen(seen);
    if seen.contains(email) {
        return false;
    }
    seen.insert(email.to_string())
}

fn lock_seen(seen: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_lookup(
    joined: Result<Result<(), PipelineError>, tokio::task::JoinError>,
) -> Result<(), PipelineError> {
    let result = joined.map_err(PipelineError::from).and_then(|r| r);
    if let Err(ref e) = result
        && !e.is_cancellation()
    {
        error!(error = %e, "User lookup failed");
    }
    result
}
