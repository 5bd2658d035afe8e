//! Domain types shared by every stage of the loop.

pub mod artifact;
pub mod brief;
pub mod classified;
pub mod outcome;
pub mod program;
pub mod state;

pub use artifact::{ArtifactKey, ArtifactKind, Iteration, Phase, RunId};
pub use brief::{BriefError, StrategyBrief, StrategyName};
pub use classified::{ClassifiedError, ErrorKind};
pub use outcome::{RunOutcome, RunStatus};
pub use program::Program;
pub use state::{DebugState, Resolution};
