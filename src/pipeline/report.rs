//! The spam report pipeline: addresses → users → messages → verdicts → report.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::classifier::CheckSpam;
use crate::pipeline::combiner::CombineResults;
use crate::pipeline::fetcher::SelectMessages;
use crate::pipeline::resolver::SelectUsers;
use crate::pipeline::runner::{Pipeline, RunSummary};
use crate::pipeline::types::ReportLine;
use crate::services::Services;

/// Builds and runs the four-stage spam report.
pub struct SpamReport {
    services: Services,
    config: PipelineConfig,
}

impl SpamReport {
    pub fn new(services: Services, config: PipelineConfig) -> Self {
        Self { services, config }
    }

    /// Run the report over `addresses`, aborting when `cancel` fires.
    pub async fn run<I>(
        &self,
        addresses: I,
        cancel: CancellationToken,
    ) -> Result<RunSummary<ReportLine>, PipelineError>
    where
        I: IntoIterator<Item = String> + Send + 'static,
        I::IntoIter: Send,
    {
        info!(
            max_users_batch = self.config.max_users_batch,
            max_concurrent_classifications = self.config.max_concurrent_classifications,
            max_concurrent_lookups = self.config.max_concurrent_lookups,
            "Running spam report"
        );

        Pipeline::builder()
            .cancellation(cancel)
            .call_timeout(self.config.call_timeout)
            .source(addresses)
            .then(SelectUsers::new(
                self.services.users.clone(),
                self.config.max_concurrent_lookups,
            ))
            .then(SelectMessages::new(
                self.services.messages.clone(),
                self.config.max_users_batch,
            ))
            .then(CheckSpam::new(
                self.services.classifier.clone(),
                self.config.max_concurrent_classifications,
            ))
            .then(CombineResults::new())
            .run()
            .await
    }

    /// Run to completion and return just the formatted lines.
    pub async fn lines<I>(&self, addresses: I) -> Result<Vec<String>, PipelineError>
    where
        I: IntoIterator<Item = String> + Send + 'static,
        I::IntoIter: Send,
    {
        let summary = self.run(addresses, CancellationToken::new()).await?;
        Ok(summary
            .output
            .into_iter()
            .map(ReportLine::into_string)
            .collect())
    }
}
