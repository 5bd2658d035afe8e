//! Strategen Core: the pieces one generate-and-repair iteration is made of.
//!
//! - Domain types (briefs, artifact keys, programs, run outcomes, classified errors)
//! - Model provider gateway with a static model registry, pacing and retry
//! - Code extraction from model responses
//! - Import policy lint
//! - Sandboxed child-process execution with wall-clock timeout and cancel
//! - Outcome classification and error excerpts

pub mod cancel;
pub mod classify;
pub mod domain;
pub mod extract;
pub mod gateway;
pub mod lint;
pub mod sandbox;
pub mod traceback;

pub use cancel::CancelToken;
pub use classify::{Classifier, ClassifierRules, Verdict};
pub use extract::{extract, Extraction, ExtractionMethod};
pub use gateway::{Gateway, GatewayError, GatewayErrorKind, ModelProvider};
pub use lint::{ImportPolicy, ImportViolation};
pub use sandbox::{Launcher, SandboxCommand, SandboxRunner};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything shared across strategy threads is
    /// Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        // Domain types
        require_send::<domain::StrategyBrief>();
        require_sync::<domain::StrategyBrief>();
        require_send::<domain::ArtifactKey>();
        require_sync::<domain::ArtifactKey>();
        require_send::<domain::Program>();
        require_sync::<domain::Program>();
        require_send::<domain::RunOutcome>();
        require_sync::<domain::RunOutcome>();
        require_send::<domain::ClassifiedError>();
        require_sync::<domain::ClassifiedError>();
        require_send::<domain::DebugState>();
        require_sync::<domain::DebugState>();

        // Shared services
        require_send::<Gateway>();
        require_sync::<Gateway>();
        require_send::<SandboxRunner>();
        require_sync::<SandboxRunner>();
        require_send::<Classifier>();
        require_sync::<Classifier>();
        require_send::<ImportPolicy>();
        require_sync::<ImportPolicy>();
        require_send::<CancelToken>();
        require_sync::<CancelToken>();
        require_send::<gateway::ScriptedProvider>();
        require_sync::<gateway::ScriptedProvider>();
    }

    /// Architecture contract: a provider call sees only the request, never
    /// loop state, so one gateway can serve every strategy thread.
    #[test]
    fn provider_contract_takes_only_the_request() {
        fn _check_trait_object_builds(
            provider: &dyn ModelProvider,
            request: &gateway::GenerateRequest,
        ) -> Result<gateway::Completion, GatewayError> {
            provider.complete(request)
        }
    }
}
