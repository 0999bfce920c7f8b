//! Control adapters for container/VM/array lifecycle operations.
//!
//! Adapters are thin command-invocation wrappers. Each one exposes a fixed
//! action whitelist and reports a uniform [`OpOutcome`]; the agent relays
//! outcomes to `infrastructure.status` subscribers but never interprets them.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_common::unix_millis;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

/// Result contract shared by every control adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpOutcome {
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

impl OpOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            timestamp: unix_millis(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            timestamp: unix_millis(),
        }
    }
}

/// Executes an external program. Tests substitute a scripted runner so no
/// adapter ever shells out under test.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> anyhow::Result<String>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, program: &str, args: &[String]) -> anyhow::Result<String> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            anyhow::bail!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }
}

#[async_trait]
pub trait ControlAdapter: Send + Sync {
    fn subsystem(&self) -> &'static str;
    fn actions(&self) -> &'static [&'static str];
    async fn invoke(&self, action: &str, args: &[String]) -> OpOutcome;
}

// One adapter per subsystem; the action whitelist keeps arbitrary commands
// off the invocation path.
struct CommandAdapter {
    subsystem: &'static str,
    program: &'static str,
    actions: &'static [&'static str],
    runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl ControlAdapter for CommandAdapter {
    fn subsystem(&self) -> &'static str {
        self.subsystem
    }

    fn actions(&self) -> &'static [&'static str] {
        self.actions
    }

    async fn invoke(&self, action: &str, args: &[String]) -> OpOutcome {
        if !self.actions.contains(&action) {
            return OpOutcome::failed(format!(
                "unsupported {} action: {action}",
                self.subsystem
            ));
        }
        let mut invocation = Vec::with_capacity(args.len() + 1);
        invocation.push(action.to_string());
        invocation.extend_from_slice(args);
        match self.runner.run(self.program, &invocation).await {
            Ok(stdout) => {
                tracing::info!(subsystem = self.subsystem, action, "control operation succeeded");
                OpOutcome::ok(stdout)
            }
            Err(err) => {
                tracing::warn!(subsystem = self.subsystem, action, error = %err, "control operation failed");
                OpOutcome::failed(err.to_string())
            }
        }
    }
}

/// Subsystem name -> adapter table built once at startup.
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ControlAdapter>>,
}

impl AdapterRegistry {
    pub fn with_defaults(runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.insert(Arc::new(CommandAdapter {
            subsystem: "docker",
            program: "docker",
            actions: &["start", "stop", "restart", "pause", "unpause"],
            runner: Arc::clone(&runner),
        }));
        registry.insert(Arc::new(CommandAdapter {
            subsystem: "vm",
            program: "virsh",
            actions: &["start", "shutdown", "reboot", "destroy"],
            runner: Arc::clone(&runner),
        }));
        registry.insert(Arc::new(CommandAdapter {
            subsystem: "array",
            program: "mdadm",
            actions: &["assemble", "stop", "detail"],
            runner,
        }));
        registry
    }

    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn insert(&mut self, adapter: Arc<dyn ControlAdapter>) {
        self.adapters.insert(adapter.subsystem(), adapter);
    }

    pub fn get(&self, subsystem: &str) -> Option<Arc<dyn ControlAdapter>> {
        self.adapters.get(subsystem).cloned()
    }

    pub fn subsystems(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
