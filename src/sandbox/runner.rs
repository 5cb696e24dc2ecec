use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::debug;

use crate::sandbox::backend::ContainerBackend;
use crate::sandbox::language::{Language, LanguageRegistry};
use crate::sandbox::pool::ContainerPool;
use crate::sandbox::{CodeRunner, ExecOutput};

/// Runs submissions inside pooled containers: injects the source file,
/// invokes the language's command, and captures both streams.
pub struct DockerRunner {
    pool: Arc<ContainerPool>,
    registry: Arc<LanguageRegistry>,
    backend: Arc<dyn ContainerBackend>,
}

impl DockerRunner {
    pub fn new(
        pool: Arc<ContainerPool>,
        registry: Arc<LanguageRegistry>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            pool,
            registry,
            backend,
        }
    }

    async fn run_in_container(
        &self,
        container_id: &str,
        command: &str,
        filename: &str,
        code: &str,
    ) -> anyhow::Result<ExecOutput> {
        // Single-quote escaping so no byte in the source can terminate the
        // quoting; printf '%s' keeps the content byte-exact.
        let escaped = code.replace('\'', "'\"'\"'");
        let write_cmd = format!("mkdir -p /app && printf '%s' '{escaped}' > /app/{filename}");
        let written = self
            .backend
            .exec_capture(container_id, sh(&write_cmd))
            .await
            .context("failed to write source into container")?;
        if !written.succeeded() {
            bail!("failed to write source into container: {}", written.stderr);
        }

        self.pool.mark_running(container_id).await;

        debug!(container_id, command, "executing submission");
        self.backend
            .exec_capture(container_id, sh(&format!("cd /app && {command}")))
            .await
    }
}

fn sh(cmd: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]
}

#[async_trait]
impl CodeRunner for DockerRunner {
    async fn exec(
        &self,
        language: Language,
        filename: &str,
        code: &str,
    ) -> anyhow::Result<ExecOutput> {
        let executor = self
            .registry
            .get(language)
            .with_context(|| format!("unsupported language: {language}"))?;
        let command = executor.exec_command(filename);

        let lease = self
            .pool
            .get(language)
            .await
            .context("failed to get container from pool")?;
        debug!(container_id = %lease.id, language = %lease.language, "acquired container");

        // Release on every exit path; the container outlives the exec.
        let result = self
            .run_in_container(&lease.id, &command, filename, code)
            .await;
        self.pool.release(&lease.id).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::sandbox::pool::tests::FakeBackend;
    use crate::sandbox::pool::PoolConfig;

    fn test_runner(backend: Arc<FakeBackend>) -> DockerRunner {
        let registry = Arc::new(LanguageRegistry::builtin());
        let pool = Arc::new(
            ContainerPool::new(
                PoolConfig {
                    max_per_lang: 2,
                    reserved_per_lang: 0,
                    idle_timeout: Duration::from_secs(3600),
                },
                backend.clone(),
                registry.clone(),
                Arc::new(MetricsRegistry::new()),
            )
            .unwrap(),
        );
        DockerRunner::new(pool, registry, backend)
    }

    #[tokio::test]
    async fn exec_captures_both_streams() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_exec_result(Ok(ExecOutput::default())); // source write
        backend.push_exec_result(Ok(ExecOutput {
            stdout: "hi\n".to_string(),
            stderr: "warn\n".to_string(),
            exit_code: Some(0),
        }));
        let runner = test_runner(backend.clone());

        let output = runner
            .exec(Language::Python, "a.py", "print('hi')")
            .await
            .unwrap();
        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.stderr, "warn\n");
        assert!(output.succeeded());
    }

    #[tokio::test]
    async fn source_write_escapes_single_quotes() {
        let backend = Arc::new(FakeBackend::new());
        let runner = test_runner(backend.clone());

        runner
            .exec(Language::Python, "a.py", "print('don''t')")
            .await
            .unwrap();

        let execs = backend.execs.lock().unwrap();
        let write_cmd = &execs
            .iter()
            .find(|(_, cmd)| cmd.contains("printf"))
            .expect("no source write exec")
            .1;
        assert!(write_cmd.contains(r#"'"'"'"#));
        assert!(write_cmd.contains("> /app/a.py"));
        assert!(!write_cmd.contains("print('don"));
    }

    #[tokio::test]
    async fn command_runs_from_working_directory() {
        let backend = Arc::new(FakeBackend::new());
        let runner = test_runner(backend.clone());

        runner
            .exec(Language::Cpp, "a.cpp", "int main(){return 0;}")
            .await
            .unwrap();

        let execs = backend.execs.lock().unwrap();
        assert!(execs
            .iter()
            .any(|(_, cmd)| cmd.contains("cd /app && g++ a.cpp -o a.out && ./a.out")));
    }

    #[tokio::test]
    async fn container_is_released_after_failure() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_exec_result(Ok(ExecOutput::default())); // source write
        backend.push_exec_result(Err(anyhow::anyhow!("exec died")));
        let runner = test_runner(backend.clone());

        assert!(runner.exec(Language::Python, "a.py", "x").await.is_err());

        // The pool must hand the same container out again: proof the
        // failing path released it.
        let reused = runner
            .exec(Language::Python, "a.py", "print(1)")
            .await
            .unwrap();
        assert!(reused.succeeded());
        assert_eq!(backend.created(), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_erred() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_exec_result(Ok(ExecOutput::default())); // source write
        backend.push_exec_result(Ok(ExecOutput {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: Some(1),
        }));
        let runner = test_runner(backend.clone());

        let output = runner.exec(Language::Python, "a.py", "x").await.unwrap();
        assert!(!output.succeeded());
        assert_eq!(output.stderr, "boom");
    }

    #[tokio::test]
    async fn failed_source_write_aborts_execution() {
        let backend = Arc::new(FakeBackend::new());
        backend.push_exec_result(Ok(ExecOutput {
            stdout: String::new(),
            stderr: "no space left on device".to_string(),
            exit_code: Some(1),
        }));
        let runner = test_runner(backend.clone());

        let err = runner.exec(Language::Python, "a.py", "x").await.unwrap_err();
        assert!(err.to_string().contains("failed to write source"));
    }
}
