//! Deal dispatch: matching pieces to counterparties until each piece reaches
//! its replication target.

use std::time::Duration;

pub mod market;
pub mod orchestrator;
pub mod report;
pub mod tracker;

pub use market::{DealMarket, HttpDealMarket};
pub use orchestrator::Dispatcher;
pub use report::DispatchReport;
pub use tracker::{DealTracker, PieceState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// A single pass; a piece with no candidates and no replicas fails.
    OneShot,
    /// One pass of a polling loop; pieces without candidates wait for the
    /// next pass.
    Continuous,
}

#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// Upper bound on a single proposal.
    pub deal_timeout: Duration,
    pub poll_interval: Duration,
    /// Rounds per piece per pass.
    pub max_rounds: u32,
    /// Pieces of one task dispatched at once.
    pub piece_concurrency: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            deal_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(60),
            max_rounds: 8,
            piece_concurrency: 4,
        }
    }
}
