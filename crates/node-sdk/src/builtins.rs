//! Built-in commands the gateway uses to probe a node: `system.which` and
//! `system.run`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::registry::{CommandRegistry, NodeCommand};
use crate::types::{CommandContext, CommandError, CommandResult};

pub const CMD_SYSTEM_WHICH: &str = "system.which";
pub const CMD_SYSTEM_RUN: &str = "system.run";

/// Default `system.run` deadline when neither params nor the invoke frame
/// carry one.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);

pub fn register_system_commands(reg: &mut CommandRegistry) {
    reg.register(CMD_SYSTEM_WHICH, SystemWhich);
    reg.register(CMD_SYSTEM_RUN, SystemRun::default());
}

// ── system.which ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WhichParams {
    #[serde(default)]
    bins: Vec<String>,
}

/// `{bins: [...]}` → `{bins: [...found]}`, in request order.
pub struct SystemWhich;

#[async_trait::async_trait]
impl NodeCommand for SystemWhich {
    async fn call(&self, _ctx: CommandContext, params: serde_json::Value) -> CommandResult {
        let params: WhichParams = serde_json::from_value(params)
            .map_err(|e| CommandError::InvalidParams(e.to_string()))?;
        let found = tokio::task::spawn_blocking(move || {
            params
                .bins
                .into_iter()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty() && which::which(b).is_ok())
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CommandError::Failed(e.to_string()))?;
        Ok(json!({ "bins": found }))
    }
}

// ── system.run ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunParams {
    command: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// `{command: [argv...], cwd?, env?, timeoutMs?}` →
/// `{exitCode, stdout, stderr}`.  A non-zero exit is still a successful
/// invocation; only spawn failures and timeouts are errors.
pub struct SystemRun {
    default_timeout: Duration,
}

impl Default for SystemRun {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

impl SystemRun {
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

#[async_trait::async_trait]
impl NodeCommand for SystemRun {
    async fn call(&self, ctx: CommandContext, params: serde_json::Value) -> CommandResult {
        let params: RunParams = serde_json::from_value(params)
            .map_err(|e| CommandError::InvalidParams(e.to_string()))?;
        let Some((program, args)) = params.command.split_first() else {
            return Err(CommandError::InvalidParams("command must not be empty".into()));
        };
        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .or(ctx.timeout)
            .unwrap_or(self.default_timeout);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(&params.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd
            .spawn()
            .map_err(|e| CommandError::Failed(format!("spawn {program}: {e}")))?;

        let output = tokio::select! {
            out = tokio::time::timeout(timeout, child.wait_with_output()) => match out {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(CommandError::Failed(e.to_string())),
                Err(_) => {
                    tracing::warn!(program = %program, timeout_ms = timeout.as_millis() as u64, "system.run timed out");
                    return Err(CommandError::Timeout(format!(
                        "command timed out after {}ms",
                        timeout.as_millis()
                    )));
                }
            },
            _ = ctx.cancel.cancelled() => {
                return Err(CommandError::Unavailable("connection closed".into()));
            }
        };

        Ok(json!({
            "exitCode": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }
}
