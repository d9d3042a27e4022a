//! `SelectMessages` — batches users and fetches their messages.
//!
//! Users are grouped into batches of `max_users_batch`. Each full batch
//! is fetched by its own task as soon as it fills; a trailing partial
//! batch is flushed once the input closes. Messages are forwarded one by
//! one as each fetch returns, so there is no ordering across batches.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::pipeline::conduit::{Inbound, Outbound};
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{Message, User};
use crate::services::MessageStore;

/// Fetcher stage: `User`s in, `Message`s out.
pub struct SelectMessages {
    store: Arc<dyn MessageStore>,
    max_users_batch: usize,
}

impl SelectMessages {
    pub fn new(store: Arc<dyn MessageStore>, max_users_batch: usize) -> Self {
        Self {
            store,
            max_users_batch: max_users_batch.max(1),
        }
    }

    fn spawn_fetch(
        &self,
        fetches: &mut JoinSet<Result<usize, PipelineError>>,
        ctx: &StageContext,
        batch: Vec<User>,
        output: &Outbound<Message>,
    ) {
        let store = Arc::clone(&self.store);
        let ctx = ctx.clone();
        let output = output.clone();
        fetches.spawn(async move {
            let batch_size = batch.len();
            let messages = ctx
                .call("fetch_messages", store.fetch_messages(&batch), |source| {
                    PipelineError::Fetch { batch_size, source }
                })
                .await?;

            let count = messages.len();
            debug!(users = batch_size, messages = count, "Fetched message batch");
            for message in messages {
                output.send(message).await?;
            }
            Ok::<_, PipelineError>(count)
        });
    }
}

#[async_trait]
impl Stage for SelectMessages {
    type Input = User;
    type Output = Message;

    fn name(&self) -> &'static str {
        "select_messages"
    }

    async fn run(
        &self,
        ctx: StageContext,
        mut input: Inbound<User>,
        output: Outbound<Message>,
    ) -> Result<(), PipelineError> {
        let mut fetches = JoinSet::new();
        let mut batch = Vec::with_capacity(self.max_users_batch);
        let mut batches = 0usize;
        let mut messages = 0usize;
        loop {
            // A failed fetch ends the stage even while upstream is idle.
            let user = tokio::select! {
                Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                    messages += check_fetch(joined)?;
                    continue;
                }
                next = input.recv() => match next? {
                    Some(user) => user,
                    None => break,
                },
            };

            batch.push(user);
            if batch.len() == self.max_users_batch {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.max_users_batch));
                self.spawn_fetch(&mut fetches, &ctx, full, &output);
                batches += 1;
            }
        }

        if !batch.is_empty() {
            self.spawn_fetch(&mut fetches, &ctx, batch, &output);
            batches += 1;
        }

        while let Some(joined) = fetches.join_next().await {
            messages += check_fetch(joined)?;
        }

        info!(batches, messages, "Fetched messages");
        Ok(())
    }
}

fn check_fetch(
    joined: Result<Result<usize, PipelineError>, tokio::task::JoinError>,
) -> Result<usize, PipelineError> {
    let result = joined.map_err(PipelineError::from).and_then(|r| r);
    if let Err(ref e) = result
        && !e.is_cancellation()
    {
        error!(error = %e, "Message fetch failed");
    }
    result
}
