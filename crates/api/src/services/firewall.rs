//! Host firewall control through a privileged helper.
//!
//! The helper invocation (e.g. `sudo -n ufw`) is executed as argv with a
//! wall-clock timeout; nothing is ever interpolated through a shell. The
//! helper's output is the trust boundary: "already exists"/"not found" are
//! idempotent soft successes, an authentication failure is fatal.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::FirewallSettings;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("firewall authentication failed: {0}")]
    AuthFailed(String),

    #[error("firewall command timed out after {0}s")]
    Timeout(u64),

    #[error("firewall command failed: {0}")]
    Command(String),
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Whether the rule set actually changed (`false` for soft successes).
    pub changed: bool,
    pub output: String,
}

/// Host firewall backend contract.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn deny(&self, ip: &str) -> Result<CommandOutcome, FirewallError>;
    async fn allow(&self, ip: &str) -> Result<CommandOutcome, FirewallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOp {
    Deny,
    Allow,
}

const AUTH_FAILURE_MARKERS: [&str; 4] = [
    "a password is required",
    "authentication fail",
    "incorrect password",
    "sorry, try again",
];

/// Interpret helper output for one rule operation.
fn classify(op: RuleOp, success: bool, output: &str) -> Result<CommandOutcome, FirewallError> {
    if success {
        return Ok(CommandOutcome {
            changed: true,
            output: output.to_string(),
        });
    }

    let lower = output.to_lowercase();
    if AUTH_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Err(FirewallError::AuthFailed(output.trim().to_string()));
    }

    let soft = match op {
        RuleOp::Deny => lower.contains("already exists") || lower.contains("existing rule"),
        RuleOp::Allow => {
            lower.contains("not found")
                || lower.contains("no matching rule")
                || lower.contains("could not delete")
        }
    };
    if soft {
        return Ok(CommandOutcome {
            changed: false,
            output: output.to_string(),
        });
    }

    Err(FirewallError::Command(output.trim().to_string()))
}

/// UFW-backed firewall: `<helper> deny from <ip>` / `<helper> delete deny from <ip>`.
pub struct UfwFirewall {
    command: Vec<String>,
    timeout: Duration,
}

impl UfwFirewall {
    pub fn from_settings(settings: &FirewallSettings) -> Self {
        UfwFirewall {
            command: settings.command.clone(),
            timeout: Duration::from_secs(settings.timeout_seconds),
        }
    }

    async fn run(&self, op: RuleOp, args: &[&str]) -> Result<CommandOutcome, FirewallError> {
        let Some(program) = self.command.first() else {
            return Err(FirewallError::Command("no firewall command configured".to_string()));
        };

        let mut command = Command::new(program);
        command
            .args(&self.command[1..])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| FirewallError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| FirewallError::Command(format!("failed to spawn helper: {e}")))?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        classify(op, output.status.success(), &combined)
    }
}

#[async_trait]
impl FirewallBackend for UfwFirewall {
    async fn deny(&self, ip: &str) -> Result<CommandOutcome, FirewallError> {
        self.run(RuleOp::Deny, &["deny", "from", ip]).await
    }

    async fn allow(&self, ip: &str) -> Result<CommandOutcome, FirewallError> {
        self.run(RuleOp::Allow, &["delete", "deny", "from", ip]).await
    }
}

/// Backend that records intent without touching the host. Used when no
/// privileged helper is available.
#[derive(Default)]
pub struct NoopFirewall;

#[async_trait]
impl FirewallBackend for NoopFirewall {
    async fn deny(&self, ip: &str) -> Result<CommandOutcome, FirewallError> {
        tracing::info!(ip, "noop firewall: deny");
        Ok(CommandOutcome {
            changed: true,
            output: String::new(),
        })
    }

    async fn allow(&self, ip: &str) -> Result<CommandOutcome, FirewallError> {
        tracing::info!(ip, "noop firewall: allow");
        Ok(CommandOutcome {
            changed: true,
            output: String::new(),
        })
    }
}
