//! External tools run as child processes.
//!
//! A tool is invoked as `<program> [args..] <request.json>` inside the
//! stage directory. The request holds the stage name, resolved inputs and
//! parameters; the tool answers by writing `outputs.json`, an object mapping
//! output ports to values. Combined stdout and stderr go to `<stage>.log`.

use super::executor::{StageContext, StageExecutor};
use crate::workflows::executors;
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Request file written for the tool.
pub const REQUEST_FILE: &str = "request.json";
/// Response file the tool writes.
pub const RESPONSE_FILE: &str = "outputs.json";

const STDERR_TAIL: usize = 2000;

/// Runs an external program for one executor name.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandExecutor {
    /// Creates an executor running `program`.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends fixed arguments placed before the request path.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn request(ctx: &StageContext) -> Value {
        json!({
            "stage": ctx.stage.name,
            "executor": ctx.stage.executor,
            "inputs": ctx.inputs,
            "params": ctx.stage.params,
            "threads": ctx.stage.hints.n_procs,
            "output_dir": ctx.output_dir.display().to_string(),
        })
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<HashMap<String, Value>> {
        let request = ctx.output_file(REQUEST_FILE);
        tokio::fs::write(&request, serde_json::to_vec_pretty(&Self::request(ctx))?)
            .await
            .with_context(|| format!("writing {}", request.display()))?;

        debug!(stage = %ctx.name(), program = %self.program.display(), "Spawning external tool");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request)
            .current_dir(&ctx.output_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.program.display()))?;

        let mut log = output.stdout.clone();
        log.extend_from_slice(&output.stderr);
        let log_path = ctx.output_file(&format!("{}.log", self.name));
        tokio::fs::write(&log_path, &log)
            .await
            .with_context(|| format!("writing {}", log_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let tail = stderr.get(start..).unwrap_or(&stderr).trim();
            return Err(anyhow!("{} exited with {}: {tail}", self.program.display(), output.status));
        }

        let response = ctx.output_file(RESPONSE_FILE);
        let bytes = tokio::fs::read(&response)
            .await
            .with_context(|| format!("{} wrote no {RESPONSE_FILE}", self.program.display()))?;
        let outputs: HashMap<String, Value> =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", response.display()))?;
        Ok(outputs)
    }
}

/// One command executor per external tool, each running
/// `<bin_dir>/qsmflow-<executor>`.
#[must_use]
pub fn external_commands(bin_dir: &Path) -> Vec<Arc<dyn StageExecutor>> {
    executors::EXTERNAL
        .iter()
        .map(|name| {
            let program = bin_dir.join(format!("qsmflow-{name}"));
            Arc::new(CommandExecutor::new(*name, program)) as Arc<dyn StageExecutor>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::graph::StageSpec;

    fn ctx(dir: &Path) -> StageContext {
        let spec = StageSpec::new("qsm.inversion.e0", StageKind::Inversion, executors::RTS)
            .with_output("qsm")
            .with_param("delta", json!(0.15));
        let inputs = HashMap::from([("field".to_string(), json!("/work/field.nii"))]);
        StageContext::new(spec, inputs, dir)
    }

    #[tokio::test]
    async fn test_tool_response_becomes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(executors::RTS, "sh")
            .with_args(["-c", r#"test -f "$1" && echo '{"qsm": "chi.nii"}' > outputs.json"#, "rts"]);
        let outputs = executor.execute(&ctx(dir.path())).await.unwrap();
        assert_eq!(outputs["qsm"], json!("chi.nii"));

        let request: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(REQUEST_FILE)).unwrap()).unwrap();
        assert_eq!(request["stage"], json!("qsm.inversion.e0"));
        assert_eq!(request["params"]["delta"], json!(0.15));
        assert_eq!(request["inputs"]["field"], json!("/work/field.nii"));
        assert!(dir.path().join("rts.log").exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(executors::RTS, "sh").with_args(["-c", "echo boom >&2; exit 3", "rts"]);
        let err = executor.execute(&ctx(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_response_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(executors::RTS, "sh").with_args(["-c", "true", "rts"]);
        let err = executor.execute(&ctx(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains(RESPONSE_FILE));
    }

    #[test]
    fn test_external_commands_cover_external_tools() {
        let commands = external_commands(Path::new("/opt/qsmflow/bin"));
        assert_eq!(commands.len(), executors::EXTERNAL.len());
        assert!(commands.iter().any(|c| c.name() == executors::ROMEO));
    }
}
