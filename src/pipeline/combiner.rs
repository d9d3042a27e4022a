//! `CombineResults` — drains every classification and emits the ranked report.
//!
//! This is the only stage that orders anything, and it can only do so
//! because it reads its whole input before sorting.

use std::cmp::Ordering;

use async_trait::async_trait;
use tracing::info;

use crate::error::PipelineError;
use crate::pipeline::conduit::{Inbound, Outbound};
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{Classification, ReportLine};

/// Combiner stage: `Classification`s in, sorted `ReportLine`s out.
#[derive(Debug, Default, Clone, Copy)]
pub struct CombineResults;

impl CombineResults {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for CombineResults {
    type Input = Classification;
    type Output = ReportLine;

    fn name(&self) -> &'static str {
        "combine_results"
    }

    async fn run(
        &self,
        _ctx: StageContext,
        mut input: Inbound<Classification>,
        output: Outbound<ReportLine>,
    ) -> Result<(), PipelineError> {
        let mut results = Vec::new();
        while let Some(result) = input.recv().await? {
            results.push(result);
        }

        rank(&mut results);
        let spam = results.iter().filter(|r| r.is_spam).count();
        info!(total = results.len(), spam, "Emitting report");

        for result in &results {
            output.send(result.to_report_line()).await?;
        }
        Ok(())
    }
}

/// Report order: spam first, then ascending message id.
pub fn report_order(a: &Classification, b: &Classification) -> Ordering {
    b.is_spam
        .cmp(&a.is_spam)
        .then_with(|| a.message_id.cmp(&b.message_id))
}

/// Sort classifications into report order.
pub fn rank(results: &mut [Classification]) {
    results.sort_by(report_order);
}
