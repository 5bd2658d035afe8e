//! Strategen Runner: the research → backtest → debug pipeline.
//!
//! This crate builds on `strategen-core` to provide:
//! - Pipeline configuration from TOML
//! - The on-disk artifact store and its run ledger
//! - Phase prompts
//! - The debug iterator state machine
//! - Single-strategy and batch pipeline runs
//! - Brief files

pub mod briefs;
pub mod config;
pub mod debug_loop;
pub mod pipeline;
pub mod prompts;
pub mod records;
pub mod store;

pub use briefs::{load_briefs, parse_briefs, BriefFileError};
pub use config::{ClassifierConfig, ConfigError, PipelineConfig, PromptOverrides};
pub use debug_loop::{AbortCause, GenerationSettings, LoopState, Transition};
pub use pipeline::{PhaseGateways, Pipeline, PipelineError, StrategyReport};
pub use prompts::PromptSet;
pub use records::TerminalRecord;
pub use store::{ArtifactStore, StoreError};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn pipeline_is_shared_across_batch_threads() {
        assert_send::<Pipeline>();
        assert_sync::<Pipeline>();
        assert_send::<PhaseGateways>();
        assert_sync::<PhaseGateways>();
    }

    #[test]
    fn reports_and_errors_cross_threads() {
        assert_send::<StrategyReport>();
        assert_sync::<StrategyReport>();
        assert_send::<PipelineError>();
    }

    #[test]
    fn store_is_send_sync() {
        assert_send::<ArtifactStore>();
        assert_sync::<ArtifactStore>();
    }
}
