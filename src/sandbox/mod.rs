pub mod backend;
pub mod language;
pub mod pool;
pub mod runner;

use async_trait::async_trait;

use crate::sandbox::language::Language;

/// Captured result of one in-container command invocation. The two streams
/// are kept separate all the way into the result store.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code.unwrap_or(0) == 0
    }
}

/// Executes a source snippet for a language and returns the captured
/// streams. Retry and repair are the caller's policy, never the runner's.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn exec(
        &self,
        language: Language,
        filename: &str,
        code: &str,
    ) -> anyhow::Result<ExecOutput>;
}
