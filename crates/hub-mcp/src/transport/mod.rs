//! Process launching for remote providers

use async_trait::async_trait;
use hub_config::LaunchSpec;
use hub_core::Result;

use crate::codec::{BoxedReader, BoxedWriter};

pub mod stdio;

pub use stdio::ProcessLauncher;

/// How a provider process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

/// Handle on a launched provider process.
#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> Result<ExitInfo>;

    async fn kill(&mut self) -> Result<()>;
}

/// Streams and process handle of a freshly launched provider.
pub struct Spawned {
    /// Provider's stdout: responses and provider-initiated messages
    pub reader: BoxedReader,
    /// Provider's stdin
    pub writer: BoxedWriter,
    pub process: Box<dyn ProcessHandle>,
}

/// Starts provider processes from their launch specs.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, name: &str, spec: &LaunchSpec) -> Result<Spawned>;
}
