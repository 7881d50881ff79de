//! Command registry: maps command names to handlers.  The registered names
//! are the commands the node declares in its handshake.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::{CommandContext, CommandResult};

/// Implement this trait to handle `invoke` frames from the gateway.
///
/// # Example
///
/// ```rust,no_run
/// use nb_node_sdk::{CommandContext, CommandResult, NodeCommand};
///
/// struct Uptime;
///
/// #[async_trait::async_trait]
/// impl NodeCommand for Uptime {
///     async fn call(&self, _ctx: CommandContext, _params: serde_json::Value) -> CommandResult {
///         Ok(serde_json::json!({ "uptimeSecs": 42 }))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait NodeCommand: Send + Sync + 'static {
    async fn call(&self, ctx: CommandContext, params: serde_json::Value) -> CommandResult;
}

#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn NodeCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `system.which` and `system.run` commands.
    pub fn with_system_commands() -> Self {
        let mut reg = Self::new();
        crate::builtins::register_system_commands(&mut reg);
        reg
    }

    /// Register a command.  Names are matched exactly; surrounding
    /// whitespace is trimmed.  A later registration replaces an earlier one.
    pub fn register<C: NodeCommand>(&mut self, name: impl Into<String>, command: C) -> &mut Self {
        self.register_arc(name, Arc::new(command))
    }

    pub fn register_arc(&mut self, name: impl Into<String>, command: Arc<dyn NodeCommand>) -> &mut Self {
        let name = name.into().trim().to_string();
        if !name.is_empty() {
            self.commands.insert(name, command);
        }
        self
    }

    /// Declared command names, sorted.
    pub fn command_names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn NodeCommand>> {
        self.commands.get(command).cloned()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommandError;
    use tokio_util::sync::CancellationToken;

    struct Echo;
    #[async_trait::async_trait]
    impl NodeCommand for Echo {
        async fn call(&self, _ctx: CommandContext, params: serde_json::Value) -> CommandResult {
            Ok(params)
        }
    }

    struct Fail;
    #[async_trait::async_trait]
    impl NodeCommand for Fail {
        async fn call(&self, _ctx: CommandContext, _params: serde_json::Value) -> CommandResult {
            Err(CommandError::Failed("intentional".into()))
        }
    }

    fn ctx(name: &str) -> CommandContext {
        CommandContext {
            request_id: "req-1".into(),
            command: name.into(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn names_are_sorted_and_trimmed() {
        let mut reg = CommandRegistry::new();
        reg.register("z.cmd", Echo).register(" a.cmd ", Echo).register("  ", Echo);
        assert_eq!(reg.command_names(), vec!["a.cmd", "z.cmd"]);
        assert!(reg.get("a.cmd").is_some());
        assert!(reg.get("A.CMD").is_none());
    }

    #[test]
    fn system_commands_are_declared() {
        let reg = CommandRegistry::with_system_commands();
        assert_eq!(reg.command_names(), vec!["system.run", "system.which"]);
    }

    #[tokio::test]
    async fn handlers_receive_params() {
        let mut reg = CommandRegistry::new();
        reg.register("echo", Echo).register("fail", Fail);

        let out = reg
            .get("echo")
            .unwrap()
            .call(ctx("echo"), serde_json::json!({ "x": 1 }))
            .await;
        assert_eq!(out.unwrap(), serde_json::json!({ "x": 1 }));

        let err = reg
            .get("fail")
            .unwrap()
            .call(ctx("fail"), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("intentional"));
    }
}
