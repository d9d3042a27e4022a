//! `CheckSpam` — a fixed pool of workers classifying messages.
//!
//! Classification is the most expensive external call, so this stage
//! caps it explicitly: exactly `pool_size` workers share the inbound
//! conduit and each claims the next message when it becomes free.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::pipeline::conduit::{Inbound, Outbound, SharedInbound};
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{Classification, Message};
use crate::services::SpamClassifier;

/// Classifier stage: `Message`s in, `Classification`s out.
pub struct CheckSpam {
    classifier: Arc<dyn SpamClassifier>,
    pool_size: usize,
}

impl CheckSpam {
    pub fn new(classifier: Arc<dyn SpamClassifier>, pool_size: usize) -> Self {
        Self {
            classifier,
            pool_size: pool_size.max(1),
        }
    }
}

#[async_trait]
impl Stage for CheckSpam {
    type Input = Message;
    type Output = Classification;

    fn name(&self) -> &'static str {
        "check_spam"
    }

    async fn run(
        &self,
        ctx: StageContext,
        input: Inbound<Message>,
        output: Outbound<Classification>,
    ) -> Result<(), PipelineError> {
        let input = input.shared();
        let mut workers = JoinSet::new();

        for worker_id in 0..self.pool_size {
            workers.spawn(classify_worker(
                worker_id,
                Arc::clone(&self.classifier),
                ctx.clone(),
                input.clone(),
                output.clone(),
            ));
        }

        info!(workers = self.pool_size, "Classifier pool started");

        let mut classified = 0usize;
        while let Some(joined) = workers.join_next().await {
            match joined.map_err(PipelineError::from).and_then(|r| r) {
                Ok(count) => classified += count,
                Err(e) => {
                    if !e.is_cancellation() {
                        error!(error = %e, "Classifier worker failed");
                    }
                    return Err(e);
                }
            }
        }

        info!(classified, "Classifier pool drained");
        Ok(())
    }
}

/// Claim and classify messages until the conduit closes.
async fn classify_worker(
    worker_id: usize,
    classifier: Arc<dyn SpamClassifier>,
    ctx: StageContext,
    input: SharedInbound<Message>,
    output: Outbound<Classification>,
) -> Result<usize, PipelineError> {
    let mut handled = 0usize;
    while let Some(message) = input.recv().await? {
        let message_id = message.id;
        let is_spam = ctx
            .call("is_spam", classifier.is_spam(message_id), |source| {
                PipelineError::Classify { message_id, source }
            })
            .await?;
        output.send(Classification { message_id, is_spam }).await?;
        handled += 1;
    }
    debug!(worker_id, handled, "Classifier worker finished");
    Ok(handled)
}
