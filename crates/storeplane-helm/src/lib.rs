//! Helm-backed deployment orchestration.
//!
//! Every store gets its own release and namespace on the shared
//! cluster. The orchestrator shells out to `helm` and `kubectl` through
//! the [`CommandRunner`] seam so the full provisioning workflow,
//! including its compensating rollback, is testable with scripted
//! runners.

pub mod error;
pub mod orchestrator;
pub mod policies;
pub mod release;
pub mod runner;

pub use error::{HelmError, HelmResult};
pub use orchestrator::{HelmOrchestrator, OrchestratorSettings, PollSettings, Provisioned};
pub use release::{ReleaseInfo, ReleaseState};
pub use runner::{CmdOutput, CommandRunner, ShellRunner};
