//! Pipeline runner — wires stages into a chain of conduits and supervises them.
//!
//! Each `then` starts the stage immediately on its predecessor's output
//! conduit, so a stage whose input type does not match the previous
//! stage's output is rejected at compile time.
//!
//! Failure handling is fail-fast: a stage that returns an error cancels
//! the run's token, every blocked worker unwinds, and `run` reports the
//! failing stage. Errors that only follow from that cancellation are not
//! treated as the cause. A stage that returns `Ok` without reading its
//! input to the end fails with `AbandonedInput`, so a run never succeeds
//! with cut-short output.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::conduit::{Inbound, conduit};
use crate::pipeline::stage::{Stage, StageContext};

// ── Builder ─────────────────────────────────────────────────────────

/// Run-wide settings applied before the first stage starts.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    cancel: Option<CancellationToken>,
    call_timeout: Option<Duration>,
}

impl PipelineBuilder {
    /// Abort the run when `token` is cancelled.
    ///
    /// The run uses a child token, so a stage failure never cancels the
    /// caller's token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bound every external call made by the stages.
    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Start feeding `items` into the pipeline.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn source<I>(self, items: I) -> Pipeline<I::Item>
    where
        I: IntoIterator + Send + 'static,
        I::IntoIter: Send,
        I::Item: Send + 'static,
    {
        let cancel = match self.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let ctx = StageContext::new(cancel.clone(), self.call_timeout);
        let (output, tail) = conduit::<I::Item>("source", cancel.clone());

        let source = tokio::spawn(async move {
            let mut fed = 0usize;
            for item in items {
                if let Err(e) = output.send(item).await {
                    return settle(Err(e), &cancel);
                }
                fed += 1;
            }
            debug!(items = fed, "Source exhausted");
            Ok::<_, PipelineError>(())
        });

        Pipeline {
            run_id: Uuid::new_v4(),
            ctx,
            tail,
            source,
            stages: Vec::new(),
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

struct RunningStage {
    name: &'static str,
    handle: JoinHandle<(Result<(), PipelineError>, Duration)>,
    emitted: Arc<AtomicUsize>,
}

/// A running chain of stages whose final output is `T`.
pub struct Pipeline<T> {
    run_id: Uuid,
    ctx: StageContext,
    tail: Inbound<T>,
    source: JoinHandle<Result<(), PipelineError>>,
    stages: Vec<RunningStage>,
}

/// Per-stage outcome of a completed run.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: &'static str,
    /// Items the stage handed downstream.
    pub emitted: usize,
    pub elapsed: Duration,
}

/// Output of a successful run.
#[derive(Debug)]
pub struct RunSummary<T> {
    pub run_id: Uuid,
    pub output: Vec<T>,
    pub stages: Vec<StageReport>,
}

impl Pipeline<()> {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Shorthand for `Pipeline::builder().source(items)`.
    pub fn source<I>(items: I) -> Pipeline<I::Item>
    where
        I: IntoIterator + Send + 'static,
        I::IntoIter: Send,
        I::Item: Send + 'static,
    {
        PipelineBuilder::default().source(items)
    }
}

impl<T: Send + 'static> Pipeline<T> {
    /// Append `stage`, bound to the current output as its input.
    pub fn then<S>(self, stage: S) -> Pipeline<S::Output>
    where
        S: Stage<Input = T>,
    {
        let name = stage.name();
        let (output, tail) = conduit::<S::Output>(name, self.ctx.cancel_token().clone());
        let emitted = output.sent_counter();
        let input = self.tail;
        let input_watch = input.drain_watch();
        let ctx = self.ctx.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            debug!(stage = name, "Stage started");
            // `output` moves into `run` and is dropped when it returns,
            // which closes the next stage's input.
            let result = match stage.run(ctx.clone(), input, output).await {
                Ok(()) if !input_watch.is_drained() && !ctx.is_cancelled() => {
                    Err(PipelineError::AbandonedInput {
                        upstream: input_watch.upstream(),
                    })
                }
                other => settle(other, ctx.cancel_token()),
            };
            match &result {
                Ok(()) => debug!(stage = name, "Stage finished"),
                Err(e) if e.is_cancellation() => debug!(stage = name, "Stage cancelled"),
                Err(e) => {
                    error!(stage = name, error = %e, "Stage failed, cancelling run");
                    ctx.cancel_token().cancel();
                }
            }
            (result, started.elapsed())
        });

        let mut stages = self.stages;
        stages.push(RunningStage {
            name,
            handle,
            emitted,
        });

        Pipeline {
            run_id: self.run_id,
            ctx: self.ctx,
            tail,
            source: self.source,
            stages,
        }
    }

    /// Drain the final conduit and wait for every stage to return.
    pub async fn run(self) -> Result<RunSummary<T>, PipelineError> {
        let Pipeline {
            run_id,
            ctx,
            mut tail,
            source,
            stages,
        } = self;

        info!(%run_id, stages = stages.len(), "Pipeline started");

        let mut output = Vec::new();
        // Stops early only on cancellation; the outcome is decided below.
        while let Ok(Some(item)) = tail.recv().await {
            output.push(item);
        }
        drop(tail);

        let mut outcomes = Vec::with_capacity(stages.len() + 1);
        outcomes.push((
            "source",
            source.await.map_err(PipelineError::from).and_then(|r| r),
        ));

        let mut reports = Vec::with_capacity(stages.len());
        for stage in stages {
            let (result, elapsed) = match stage.handle.await {
                Ok(finished) => finished,
                Err(join_err) => (Err(PipelineError::from(join_err)), Duration::ZERO),
            };
            reports.push(StageReport {
                stage: stage.name,
                emitted: stage.emitted.load(Ordering::Relaxed),
                elapsed,
            });
            outcomes.push((stage.name, result));
        }

        if let Some(err) = first_failure(outcomes) {
            error!(%run_id, error = %err, "Pipeline failed");
            return Err(err);
        }
        if ctx.is_cancelled() {
            warn!(%run_id, "Pipeline cancelled");
            return Err(PipelineError::Cancelled);
        }

        info!(%run_id, output = output.len(), "Pipeline finished");
        Ok(RunSummary {
            run_id,
            output,
            stages: reports,
        })
    }
}

/// A closed downstream is only a side effect of cancellation when the run
/// was already cancelled as it was observed. Otherwise the next stage
/// returned without draining its input, and the error stands.
fn settle(
    result: Result<(), PipelineError>,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    match result {
        Err(PipelineError::DownstreamClosed { .. }) if cancel.is_cancelled() => {
            Err(PipelineError::Cancelled)
        }
        other => other,
    }
}

/// Pick the error that explains a failed run from `(stage, result)` pairs
/// listed upstream first.
///
/// A closed downstream outside cancellation always comes with the
/// downstream stage's own error, so the upstream-most error of any other
/// kind is preferred. It is still reported if nothing else is.
fn first_failure(
    outcomes: Vec<(&'static str, Result<(), PipelineError>)>,
) -> Option<PipelineError> {
    let mut knock_on = None;
    for (stage, result) in outcomes {
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => {}
            Err(e @ PipelineError::DownstreamClosed { .. }) => {
                if knock_on.is_none() {
                    knock_on = Some(PipelineError::Stage {
                        stage,
                        source: Box::new(e),
                    });
                }
            }
            Err(e) => {
                return Some(PipelineError::Stage {
                    stage,
                    source: Box::new(e),
                });
            }
        }
    }
    knock_on
}
