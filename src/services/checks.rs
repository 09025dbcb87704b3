//! Mission completion checks.
//!
//! Each check yields a [`CheckResult`]: `Passed`/`Failed` describe the
//! objective, `Error` means the check itself could not be evaluated (bad
//! config, parse failure) and is never treated as an objective failure.

use regex::Regex;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::CheckError;
use crate::domain::models::{CheckResult, CheckSpec, CheckStatus, CmpOperator};
use crate::domain::ports::Bus;

/// Polling interval while waiting for a bus response check.
const BUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct CheckRunner {
    bus: Arc<dyn Bus>,
}

impl CheckRunner {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Evaluate one check inside the mission's workspace.
    pub async fn run(&self, check: &CheckSpec, workspace: Option<&Path>) -> CheckResult {
        let name = check.name().to_string();
        let outcome = match check {
            CheckSpec::FileExists { paths, .. } => Self::check_files(paths, workspace),
            CheckSpec::Command { command, success_pattern, fail_pattern, .. } => {
                Self::check_command(command, success_pattern.as_deref(), fail_pattern.as_deref(), workspace)
                    .await
            }
            CheckSpec::Coverage { command, json_path, operator, value, .. } => {
                Self::check_coverage(command, json_path, *operator, *value, workspace).await
            }
            CheckSpec::NatsResponse {
                subject,
                success_pattern,
                fail_pattern,
                timeout_seconds,
                ..
            } => {
                self.check_bus_response(
                    subject,
                    success_pattern.as_deref(),
                    fail_pattern.as_deref(),
                    Duration::from_secs(*timeout_seconds),
                )
                .await
            }
        };

        match outcome {
            Ok((status, output)) => CheckResult { name, status, output },
            Err(err) => CheckResult {
                name,
                status: CheckStatus::Error,
                output: Some(err.to_string()),
            },
        }
    }

    // -------------------------------------------------------------------------
    // fileExists
    // -------------------------------------------------------------------------

    fn check_files(
        paths: &[String],
        workspace: Option<&Path>,
    ) -> Result<(CheckStatus, Option<String>), CheckError> {
        let root = workspace.map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let mut missing = Vec::new();
        for raw in paths {
            let candidate = Path::new(raw);
            if candidate.is_absolute()
                || candidate.components().any(|c| matches!(c, Component::ParentDir))
            {
                return Err(CheckError::PathTraversal(raw.clone()));
            }
            if !root.join(candidate).exists() {
                missing.push(raw.clone());
            }
        }

        if missing.is_empty() {
            Ok((CheckStatus::Passed, Some(format!("{} path(s) present", paths.len()))))
        } else {
            Ok((CheckStatus::Failed, Some(format!("missing: {}", missing.join(", ")))))
        }
    }

    // -------------------------------------------------------------------------
    // command
    // -------------------------------------------------------------------------

    async fn run_command(command: &str, workspace: Option<&Path>) -> Result<(i32, String, String), CheckError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(dir) = workspace {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| CheckError::CommandFailed(e.to_string()))?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    fn compile(pattern: &str) -> Result<Regex, CheckError> {
        Regex::new(pattern).map_err(|e| CheckError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    }

    async fn check_command(
        command: &str,
        success_pattern: Option<&str>,
        fail_pattern: Option<&str>,
        workspace: Option<&Path>,
    ) -> Result<(CheckStatus, Option<String>), CheckError> {
        let success_re = success_pattern.map(Self::compile).transpose()?;
        let fail_re = fail_pattern.map(Self::compile).transpose()?;

        let (code, stdout, stderr) = Self::run_command(command, workspace).await?;

        // A fail-pattern match overrides everything else.
        if let Some(re) = &fail_re {
            if re.is_match(&stdout) || re.is_match(&stderr) {
                return Ok((CheckStatus::Failed, Some(format!("fail pattern matched: {}", re.as_str()))));
            }
        }

        if code != 0 {
            return Ok((CheckStatus::Failed, Some(format!("exit code {code}"))));
        }

        if let Some(re) = &success_re {
            if !re.is_match(&stdout) {
                return Ok((
                    CheckStatus::Failed,
                    Some(format!("success pattern not found: {}", re.as_str())),
                ));
            }
        }

        Ok((CheckStatus::Passed, Some(truncate(&stdout, 500))))
    }

    // -------------------------------------------------------------------------
    // coverage
    // -------------------------------------------------------------------------

    async fn check_coverage(
        command: &str,
        json_path: &str,
        operator: CmpOperator,
        expected: f64,
        workspace: Option<&Path>,
    ) -> Result<(CheckStatus, Option<String>), CheckError> {
        let (_, stdout, _) = Self::run_command(command, workspace).await?;

        let parsed: Value =
            serde_json::from_str(stdout.trim()).map_err(|e| CheckError::InvalidJson(e.to_string()))?;

        let actual = resolve_json_path(&parsed, json_path)?;

        let passed = operator.evaluate(actual, expected);
        let status = if passed { CheckStatus::Passed } else { CheckStatus::Failed };
        Ok((status, Some(format!("{json_path} = {actual}"))))
    }

    // -------------------------------------------------------------------------
    // natsResponse
    // -------------------------------------------------------------------------

    async fn check_bus_response(
        &self,
        subject: &str,
        success_pattern: Option<&str>,
        fail_pattern: Option<&str>,
        timeout: Duration,
    ) -> Result<(CheckStatus, Option<String>), CheckError> {
        let success_re = success_pattern.map(Self::compile).transpose()?;
        let fail_re = fail_pattern.map(Self::compile).transpose()?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.bus.retained(subject).await?;

            let mut success = false;
            for envelope in &messages {
                let content = envelope.content();
                if let Some(re) = &fail_re {
                    if re.is_match(&content) {
                        return Ok((
                            CheckStatus::Failed,
                            Some(format!("fail pattern matched on {subject}")),
                        ));
                    }
                }
                match &success_re {
                    Some(re) if re.is_match(&content) => success = true,
                    None if !messages.is_empty() => success = true,
                    _ => {}
                }
            }

            if success {
                return Ok((CheckStatus::Passed, Some(format!("{} message(s) on {subject}", messages.len()))));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok((CheckStatus::Failed, Some(format!("no matching response on {subject}"))));
            }
            tokio::time::sleep(BUS_POLL_INTERVAL).await;
        }
    }
}

/// Resolve a dot-path (optionally `$.`-prefixed) to a numeric value.
/// Numeric segments index into arrays.
fn resolve_json_path(value: &Value, path: &str) -> Result<f64, CheckError> {
    let trimmed = path.strip_prefix("$.").unwrap_or(path);

    let mut current = value;
    for segment in trimmed.split('.') {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| CheckError::JsonPathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| CheckError::JsonPathNotFound(path.to_string()))?;
                items
                    .get(index)
                    .ok_or_else(|| CheckError::JsonPathNotFound(path.to_string()))?
            }
            _ => return Err(CheckError::JsonPathNotFound(path.to_string())),
        };
    }

    match current {
        Value::Number(n) => n.as_f64().ok_or_else(|| CheckError::NotNumeric {
            path: path.to_string(),
            value: current.to_string(),
        }),
        Value::String(s) => s.parse().map_err(|_| CheckError::NotNumeric {
            path: path.to_string(),
            value: s.clone(),
        }),
        other => Err(CheckError::NotNumeric {
            path: path.to_string(),
            value: other.to_string(),
        }),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.trim_end().to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::MemoryBus;
    use crate::domain::models::Envelope;

    fn runner() -> CheckRunner {
        CheckRunner::new(MemoryBus::new())
    }

    fn command_check(command: &str, success: Option<&str>, fail: Option<&str>) -> CheckSpec {
        CheckSpec::Command {
            name: "cmd".to_string(),
            command: command.to_string(),
            success_pattern: success.map(String::from),
            fail_pattern: fail.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_command_check_passes_on_pattern() {
        let result = runner().run(&command_check("echo ok", Some("ok"), None), None).await;
        assert_eq!(result.status, CheckStatus::Passed);
    }

    #[tokio::test]
    async fn test_command_check_fail_pattern_overrides_success() {
        let check = command_check("echo 'ok but ERROR happened'", Some("ok"), Some("ERROR"));
        let result = runner().run(&check, None).await;
        assert_eq!(result.status, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_command_check_nonzero_exit_fails() {
        let result = runner().run(&command_check("exit 3", None, None), None).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(result.output.unwrap().contains("exit code 3"));
    }

    #[tokio::test]
    async fn test_bad_pattern_is_error_not_failure() {
        let result = runner().run(&command_check("echo ok", Some("("), None), None).await;
        assert_eq!(result.status, CheckStatus::Error);
    }

    #[tokio::test]
    async fn test_file_exists_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("result.txt"), "done").unwrap();

        let check = CheckSpec::FileExists {
            name: "files".to_string(),
            paths: vec!["result.txt".to_string()],
        };
        let result = runner().run(&check, Some(dir.path())).await;
        assert_eq!(result.status, CheckStatus::Passed);

        let check = CheckSpec::FileExists {
            name: "files".to_string(),
            paths: vec!["missing.txt".to_string()],
        };
        let result = runner().run(&check, Some(dir.path())).await;
        assert_eq!(result.status, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_path_traversal_blocked() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["../escape.txt", "/etc/passwd"] {
            let check = CheckSpec::FileExists {
                name: "files".to_string(),
                paths: vec![bad.to_string()],
            };
            let result = runner().run(&check, Some(dir.path())).await;
            assert_eq!(result.status, CheckStatus::Error);
            assert!(result.output.unwrap().contains("path traversal blocked"));
        }
    }

    #[tokio::test]
    async fn test_coverage_check() {
        let check = CheckSpec::Coverage {
            name: "cov".to_string(),
            command: r#"echo '{"total": {"lines": {"pct": 87.5}}}'"#.to_string(),
            json_path: "$.total.lines.pct".to_string(),
            operator: CmpOperator::Ge,
            value: 80.0,
        };
        let result = runner().run(&check, None).await;
        assert_eq!(result.status, CheckStatus::Passed);

        let check = CheckSpec::Coverage {
            name: "cov".to_string(),
            command: r#"echo '{"total": {"lines": {"pct": 61.0}}}'"#.to_string(),
            json_path: "total.lines.pct".to_string(),
            operator: CmpOperator::Ge,
            value: 80.0,
        };
        let result = runner().run(&check, None).await;
        assert_eq!(result.status, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_coverage_bad_json_is_error() {
        let check = CheckSpec::Coverage {
            name: "cov".to_string(),
            command: "echo not-json".to_string(),
            json_path: "pct".to_string(),
            operator: CmpOperator::Ge,
            value: 1.0,
        };
        let result = runner().run(&check, None).await;
        assert_eq!(result.status, CheckStatus::Error);
    }

    #[tokio::test]
    async fn test_bus_response_check() {
        let bus = MemoryBus::new();
        bus.publish_retained("mission.report", &Envelope::message("cell", "mission", "all tests passing"))
            .await
            .unwrap();

        let runner = CheckRunner::new(bus);
        let check = CheckSpec::NatsResponse {
            name: "report".to_string(),
            subject: "mission.report".to_string(),
            success_pattern: Some("passing".to_string()),
            fail_pattern: None,
            timeout_seconds: 1,
        };
        let result = runner.run(&check, None).await;
        assert_eq!(result.status, CheckStatus::Passed);
    }

    #[tokio::test]
    async fn test_bus_response_timeout_fails() {
        let runner = runner();
        let check = CheckSpec::NatsResponse {
            name: "report".to_string(),
            subject: "mission.silent".to_string(),
            success_pattern: Some("never".to_string()),
            fail_pattern: None,
            timeout_seconds: 0,
        };
        let result = runner.run(&check, None).await;
        assert_eq!(result.status, CheckStatus::Failed);
    }

    #[test]
    fn test_json_path_array_index() {
        let value = serde_json::json!({ "suites": [ { "pct": 42.0 } ] });
        let got = resolve_json_path(&value, "suites.0.pct").unwrap();
        assert!((got - 42.0).abs() < f64::EPSILON);
    }
}
