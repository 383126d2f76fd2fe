//! Sandbox provider variants.
//!
//! Polymorphism is a tagged union: [`SandboxHandle`] wraps the concrete
//! providers and dispatches by match. Adding a provider is a new variant
//! plus a dispatch arm in the manager. Every operation is idempotent with
//! respect to its target state; pausing a paused sandbox is ok.

pub mod container;
pub mod microvm;
pub mod mock;
pub mod remote;

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use ar_domain::error::{Error, Result};
use ar_domain::session::SandboxType;

use crate::channel::SandboxChannel;

pub use container::ContainerSandbox;
pub use microvm::MicroVmSandbox;
pub use mock::MockSandbox;
pub use remote::RemoteSandbox;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Common inputs / outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inputs to sandbox creation, common across providers.
#[derive(Debug, Clone, Default)]
pub struct CreateSandboxOptions {
    pub session_id: String,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Secrets snapshot, already projected to env-var names. Passed by
    /// value: mutations after creation never reach the sandbox.
    pub secrets: HashMap<String, String>,
    pub repository_url: Option<String>,
    pub repository_branch: Option<String>,
    pub cpu_limit: Option<f64>,
    pub memory_mb: Option<u64>,
    pub startup_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Provisioning,
    Running,
    Paused,
    Terminated,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxDescription {
    pub status: SandboxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_tier: Option<String>,
    pub capabilities: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live binding from a session to its sandbox.
pub enum SandboxHandle {
    Mock(MockSandbox),
    Container(ContainerSandbox),
    MicroVm(MicroVmSandbox),
    Remote(RemoteSandbox),
}

impl SandboxHandle {
    pub fn provider_type(&self) -> SandboxType {
        match self {
            Self::Mock(_) => SandboxType::Mock,
            Self::Container(_) => SandboxType::Container,
            Self::MicroVm(_) => SandboxType::MicroVm,
            Self::Remote(_) => SandboxType::Remote,
        }
    }

    /// Opaque id meaningful only to this provider.
    pub fn provider_id(&self) -> &str {
        match self {
            Self::Mock(s) => s.provider_id(),
            Self::Container(s) => s.provider_id(),
            Self::MicroVm(s) => s.provider_id(),
            Self::Remote(s) => s.provider_id(),
        }
    }

    /// Open the RPC channel. The returned channel is also retained on the
    /// handle so `detach` can close it.
    pub async fn attach(&self) -> Result<SandboxChannel> {
        match self {
            Self::Mock(s) => s.attach().await,
            Self::Container(s) => s.attach().await,
            Self::MicroVm(s) => s.attach().await,
            Self::Remote(s) => s.attach().await,
        }
    }

    /// Close the active channel, if any. The sandbox keeps running.
    pub fn detach(&self) {
        match self {
            Self::Mock(s) => s.detach(),
            Self::Container(s) => s.detach(),
            Self::MicroVm(s) => s.detach(),
            Self::Remote(s) => s.detach(),
        }
    }

    pub async fn pause(&self) -> Result<()> {
        match self {
            Self::Mock(s) => s.pause().await,
            Self::Container(s) => s.pause().await,
            Self::MicroVm(s) => s.pause().await,
            Self::Remote(s) => s.pause().await,
        }
    }

    pub async fn resume(&self) -> Result<()> {
        match self {
            Self::Mock(s) => s.resume().await,
            Self::Container(s) => s.resume().await,
            Self::MicroVm(s) => s.resume().await,
            Self::Remote(s) => s.resume().await,
        }
    }

    pub async fn terminate(&self) -> Result<()> {
        match self {
            Self::Mock(s) => s.terminate().await,
            Self::Container(s) => s.terminate().await,
            Self::MicroVm(s) => s.terminate().await,
            Self::Remote(s) => s.terminate().await,
        }
    }

    pub async fn describe(&self) -> Result<SandboxDescription> {
        match self {
            Self::Mock(s) => s.describe().await,
            Self::Container(s) => s.describe().await,
            Self::MicroVm(s) => s.describe().await,
            Self::Remote(s) => s.describe().await,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a provider CLI to completion, returning trimmed stdout. Non-zero
/// exit becomes a provisioning error carrying the CLI's stderr.
pub(crate) async fn run_cli<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let args: Vec<std::ffi::OsString> =
        args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let verb = args
        .first()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default();

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Provisioning(format!("spawning {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Provisioning(format!(
            "{program} {verb} failed: {}",
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Split a configured command line into argv. No shell quoting: the agent
/// command is operator-controlled config, not user input.
pub(crate) fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
