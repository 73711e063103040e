//! Pipeline Runner - isolated execution of stage commands
//!
//! Provides the one capability the engine needs from the outside world:
//! execute a command in a controlled filesystem/environment and hand back
//! the captured results.
//! - `ProcessRunner` runs `sh -c` on the host with a scrubbed environment
//! - `ContainerRunner` shells out to a container CLI (`docker`, `podman`)
//! - `ScriptedRunner` answers from a script, for tests

pub mod artifact;
pub mod cancel;
pub mod container;
mod error;
mod exec;
pub mod fake;
pub mod invocation;
pub mod process;

use async_trait::async_trait;

// Re-export key types
pub use cancel::CancellationToken;
pub use container::ContainerRunner;
pub use error::{RunnerError, RunnerResult};
pub use fake::{ScriptStep, ScriptedRunner};
pub use invocation::{Environment, Mount, RunInvocation, RunOutcome};
pub use process::ProcessRunner;

/// Executes one stage invocation in an isolated environment.
///
/// Implementations must honour `invocation.timeout` and stop the underlying
/// work (best effort) once `cancel` fires.
#[async_trait]
pub trait RunnerAdapter: Send + Sync {
    /// Short adapter name for logs ("process", "container", ...).
    fn name(&self) -> &str;

    /// Run the invocation to completion.
    ///
    /// A non-zero exit is a normal `Ok` outcome; `Err` is reserved for the
    /// adapter itself failing (unavailable, timed out, cancelled).
    async fn run(
        &self,
        invocation: &RunInvocation,
        cancel: &CancellationToken,
    ) -> RunnerResult<RunOutcome>;
}
