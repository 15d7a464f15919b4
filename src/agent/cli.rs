//! Fallback agent execution through a local CLI tool.
//!
//! When no provider credential is present, the rendered prompt is piped to
//! a coding CLI on stdin and its stdout becomes the response text. No token
//! counts exist on this path; success is inferred from the exit code and
//! output markers.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::ProviderError;

/// Structured verdict detected in agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputVerdict {
    /// `<promise>` tag present: the stage completed its contract.
    Promised,
    /// `"status": "failed"` present: structured failure.
    Failed,
    /// `"status": "needs-review"` present: human attention requested.
    NeedsReview,
    /// No marker found.
    Unknown,
}

/// Scan output for the status markers, most severe first.
pub fn detect_verdict(output: &str) -> OutputVerdict {
    if output.contains(r#""status": "failed""#) || output.contains(r#""status":"failed""#) {
        return OutputVerdict::Failed;
    }
    if output.contains(r#""status": "needs-review""#)
        || output.contains(r#""status":"needs-review""#)
    {
        return OutputVerdict::NeedsReview;
    }
    if output.contains("<promise>") {
        return OutputVerdict::Promised;
    }
    OutputVerdict::Unknown
}

/// Default CLI command looked up on PATH.
pub const DEFAULT_COMMAND: &str = "claude";

pub struct CliAgent {
    command: String,
    args: Vec<String>,
}

#[derive(Debug)]
pub struct CliOutcome {
    pub output: String,
    pub verdict: OutputVerdict,
}

impl CliAgent {
    pub fn new(command: Option<&str>) -> Self {
        Self {
            command: command.unwrap_or(DEFAULT_COMMAND).to_string(),
            args: vec!["--print".to_string()],
        }
    }

    pub fn with_args(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the CLI with `prompt` on stdin inside `working_dir`.
    pub async fn run(&self, prompt: &str, working_dir: &Path) -> Result<CliOutcome, ProviderError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProviderError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::Request {
                    name: "cli".to_string(),
                    message: format!("failed to write prompt to stdin: {}", e),
                })?;
            stdin.shutdown().await.map_err(|e| ProviderError::Request {
                name: "cli".to_string(),
                message: format!("failed to close stdin: {}", e),
            })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::Request {
                name: "cli".to_string(),
                message: format!("failed to collect output: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            tracing::warn!(
                command = %self.command,
                exit_code,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "fallback CLI exited non-zero"
            );
            return Err(ProviderError::CliNonZeroExit { exit_code });
        }

        let verdict = detect_verdict(&stdout);
        Ok(CliOutcome {
            output: stdout,
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promise_tag_detected() {
        assert_eq!(
            detect_verdict("work done\n<promise>all criteria met</promise>"),
            OutputVerdict::Promised
        );
    }

    #[test]
    fn structured_failure_outranks_promise() {
        let output = r#"{"status": "failed", "reason": "tests red"} <promise>nope</promise>"#;
        assert_eq!(detect_verdict(output), OutputVerdict::Failed);
    }

    #[test]
    fn needs_review_detected_with_and_without_spaces() {
        assert_eq!(
            detect_verdict(r#"{"status": "needs-review"}"#),
            OutputVerdict::NeedsReview
        );
        assert_eq!(
            detect_verdict(r#"{"status":"needs-review"}"#),
            OutputVerdict::NeedsReview
        );
    }

    #[test]
    fn unmarked_output_is_unknown() {
        assert_eq!(detect_verdict("just some text"), OutputVerdict::Unknown);
    }

    #[tokio::test]
    async fn run_pipes_prompt_through_stdin() {
        // `cat` echoes the prompt back, standing in for the CLI tool.
        let agent = CliAgent::with_args("cat", Vec::new());
        let dir = tempfile::TempDir::new().unwrap();
        let outcome = agent
            .run("<promise>echoed</promise>", dir.path())
            .await
            .unwrap();
        assert_eq!(outcome.verdict, OutputVerdict::Promised);
        assert!(outcome.output.contains("echoed"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let agent = CliAgent::new(Some("definitely-not-a-real-binary-xyz"));
        let dir = tempfile::TempDir::new().unwrap();
        let err = agent.run("hi", dir.path()).await.unwrap_err();
        assert!(matches!(err, ProviderError::SpawnFailed { .. }));
    }
}
