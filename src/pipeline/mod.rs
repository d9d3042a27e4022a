//! Staged spam report pipeline.
//!
//! Addresses flow through four stages, each running concurrently and
//! connected by typed conduits:
//! 1. `SelectUsers` — resolve addresses, drop duplicate identities
//! 2. `SelectMessages` — fetch messages in fixed-size user batches
//! 3. `CheckSpam` — classify each message on a bounded worker pool
//! 4. `CombineResults` — drain, rank and format the report
//!
//! Only the last stage orders anything. The `runner` wires stages together
//! and turns any stage failure into a single run-level error.

pub mod classifier;
pub mod combiner;
pub mod conduit;
pub mod fetcher;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod stage;
pub mod types;

pub use classifier::CheckSpam;
pub use combiner::{CombineResults, rank};
pub use fetcher::SelectMessages;
pub use report::SpamReport;
pub use resolver::SelectUsers;
pub use runner::{Pipeline, PipelineBuilder, RunSummary, StageReport};
pub use stage::{Stage, StageContext};
pub use types::{Classification, Message, MessageId, ReportLine, User};
