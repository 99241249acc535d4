//! External command work function
//!
//! Each attempt spawns the configured program for one item, exports the
//! leased credential through the configured env var, and streams the child's
//! stdout and stderr through the item's output multiplexer. A non-zero exit
//! is reported as an upstream failure carrying the tail of stderr, so the
//! classifier can tell a rate limit from a rejected key from a plain crash.

use std::collections::VecDeque;
use std::io::Write;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use runner::{WorkContext, WorkError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::CommandConfig;

/// Placeholder in `command.args` replaced by the item identifier.
pub const ITEM_PLACEHOLDER: &str = "{item}";

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

pub struct CommandRunner {
    config: CommandConfig,
}

impl CommandRunner {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    pub fn render_args(&self, item_id: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| arg.replace(ITEM_PLACEHOLDER, item_id))
            .collect()
    }

    /// Run the command once for `item`.
    pub async fn run(&self, item: Arc<String>, ctx: WorkContext) -> Result<(), WorkError> {
        let program = self.config.program.as_str();
        let mut command = Command::new(program);
        command
            .args(self.render_args(&item))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref var) = self.config.credential_env
            && let Some(ref credential) = ctx.credential
        {
            command.env(var, credential.token());
        }

        debug!(
            program,
            attempt = ctx.attempt,
            credential = ctx.credential.as_ref().map(|c| c.label()).unwrap_or("none"),
            "spawning command"
        );

        let mut child = command
            .spawn()
            .map_err(|e| WorkError::failed(format!("failed to spawn {program}: {e}")))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(WorkError::failed(format!("{program}: output pipes unavailable")));
        };

        let mut output = ctx.output;
        let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let finished = async {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let (mut out_open, mut err_open) = (true, true);

            while out_open || err_open {
                tokio::select! {
                    line = out_lines.next_line(), if out_open => match line? {
                        Some(line) => writeln!(output, "{line}")?,
                        None => out_open = false,
                    },
                    line = err_lines.next_line(), if err_open => match line? {
                        Some(line) => {
                            writeln!(output, "{line}")?;
                            if stderr_tail.len() == STDERR_TAIL_LINES {
                                stderr_tail.pop_front();
                            }
                            stderr_tail.push_back(line);
                        }
                        None => err_open = false,
                    },
                }
            }
            child.wait().await
        };
        let waited = tokio::time::timeout(timeout, finished).await;

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(WorkError::failed(format!("{program}: I/O error: {e}")));
            }
            Err(_) => {
                warn!(program, timeout_secs = timeout.as_secs(), "command timed out, killing");
                let _ = child.kill().await;
                return Err(WorkError::failed(format!(
                    "{program} timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        if status.success() {
            return Ok(());
        }
        Err(exit_failure(program, status, &stderr_tail))
    }
}

fn exit_failure(program: &str, status: ExitStatus, stderr_tail: &VecDeque<String>) -> WorkError {
    let tail = stderr_tail
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    let message = if tail.trim().is_empty() {
        format!("{program} exited with {status}")
    } else {
        format!("{program} exited with {status}: {tail}")
    };
    WorkError::upstream(None, message)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use credential_pool::Pool;
    use runner::{MemoryBuffer, SharedSink};
    use tokio_util::sync::CancellationToken;

    fn shell(script: &str, timeout_secs: u64) -> CommandRunner {
        CommandRunner::new(CommandConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into(), ITEM_PLACEHOLDER.into()],
            credential_env: Some("WORKFLOW_TOKEN".into()),
            timeout_secs,
        })
    }

    async fn context(item_id: &str, pool: Option<&Arc<Pool>>) -> (WorkContext, MemoryBuffer) {
        let (sink, buffer) = SharedSink::buffer();
        let credential = match pool {
            Some(pool) => {
                let lease = pool.acquire(None, &CancellationToken::new()).await.unwrap();
                Some(lease.credential().clone())
            }
            None => None,
        };
        let ctx = WorkContext {
            item_id: item_id.to_string(),
            attempt: 1,
            credential,
            output: sink.mux(format!("[{item_id}] ")),
            shutdown: CancellationToken::new(),
        };
        (ctx, buffer)
    }

    #[test]
    fn placeholder_substituted_in_every_arg() {
        let runner = CommandRunner::new(CommandConfig {
            program: "claude".into(),
            args: vec!["-p".into(), "Review {item} then file {item}".into()],
            credential_env: None,
            timeout_secs: 10,
        });
        assert_eq!(
            runner.render_args("issue-42"),
            vec!["-p", "Review issue-42 then file issue-42"]
        );
    }

    #[tokio::test]
    async fn success_streams_prefixed_output() {
        let runner = shell(r#"echo "drafting $1"; echo "warning on stderr" >&2"#, 10);
        let (ctx, buffer) = context("doc-1", None).await;

        runner.run(Arc::new("doc-1".into()), ctx).await.unwrap();

        let lines = buffer.lines();
        assert!(lines.contains(&"[doc-1] drafting doc-1".to_string()), "{lines:?}");
        assert!(lines.contains(&"[doc-1] warning on stderr".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn credential_exported_to_child() {
        let pool = Arc::new(Pool::new(["sk-child-visible"]));
        let runner = shell(r#"test "$WORKFLOW_TOKEN" = "sk-child-visible""#, 10);
        let (ctx, _) = context("doc-2", Some(&pool)).await;
        runner.run(Arc::new("doc-2".into()), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr_for_classification() {
        let runner = shell(r#"echo "Error: 429 rate limit exceeded" >&2; exit 1"#, 10);
        let (ctx, _) = context("doc-3", None).await;

        let err = runner.run(Arc::new("doc-3".into()), ctx).await.unwrap_err();
        let WorkError::Upstream { status, message } = &err else {
            panic!("expected upstream error, got {err:?}");
        };
        assert_eq!(*status, None);
        assert!(message.contains("rate limit exceeded"), "{message}");
        assert_eq!(
            upstream::classify(message, *status).category,
            upstream::ErrorCategory::RateLimited
        );
    }

    #[tokio::test]
    async fn silent_failure_reports_exit_status() {
        let runner = shell("exit 3", 10);
        let (ctx, _) = context("doc-4", None).await;
        let err = runner.run(Arc::new("doc-4".into()), ctx).await.unwrap_err();
        assert!(err.to_string().contains("exited with"), "{err}");
    }

    #[tokio::test]
    async fn missing_program_is_plain_failure() {
        let runner = CommandRunner::new(CommandConfig {
            program: "/nonexistent/definitely-not-a-binary".into(),
            args: Vec::new(),
            credential_env: None,
            timeout_secs: 10,
        });
        let (ctx, _) = context("doc-5", None).await;
        let err = runner.run(Arc::new("doc-5".into()), ctx).await.unwrap_err();
        assert!(matches!(err, WorkError::Failed(ref m) if m.contains("failed to spawn")), "{err:?}");
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let runner = shell("sleep 30", 1);
        let (ctx, _) = context("doc-6", None).await;
        let started = std::time::Instant::now();
        let err = runner.run(Arc::new("doc-6".into()), ctx).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.to_string().contains("timed out after 1s"), "{err}");
    }

    #[test]
    fn failure_message_ends_with_stderr_tail() {
        let tail: VecDeque<String> = (0..3).map(|i| format!("line {i}")).collect();
        let err = exit_failure("tool", std::process::ExitStatus::default(), &tail);
        assert!(err.to_string().ends_with("line 0\nline 1\nline 2"), "{err}");
    }
}
