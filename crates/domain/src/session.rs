//! Session, environment, and secret data model.
//!
//! A session is the unit of conversation with one agent; it owns exactly one
//! sandbox at a time. Status transitions are driven by the hub, the reaper,
//! and explicit archive/delete calls; the transition table lives here so the
//! gateway and the store enforce the same rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Chat,
    Code,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(Self::Chat),
            "code" => Ok(Self::Code),
            other => Err(Error::Validation(format!("unknown session mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Active,
    Idle,
    Archived,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Archived => "archived",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "archived" => Ok(Self::Archived),
            "error" => Ok(Self::Error),
            other => Err(Error::Store(format!("unknown session status: {other}"))),
        }
    }

    /// Whether a transition to `to` is legal.
    ///
    /// `creating → active | error`, `active ↔ idle`, `error → active`
    /// (re-activate rebuilds the sandbox), any non-archived → `error`,
    /// any → `archived`. Archived is terminal short of deletion.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (_, to) if self == to => true, // idempotent updates are allowed
            (Archived, _) => false,
            (_, Archived) => true,
            (_, Error) => true,
            (Creating, Active) => true,
            (Active, Idle) => true,
            (Idle, Active) => true,
            (Error, Active) => true,
            _ => false,
        }
    }
}

/// A single relay session and its persisted attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    /// Code-mode metadata; absent for chat sessions.
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub repository_branch: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    /// Provider currently (or last) backing this session.
    #[serde(default)]
    pub sandbox_type: Option<SandboxType>,
    /// Opaque id meaningful only to that provider.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// Absolute path of the session's data directory on the host.
    pub data_dir: String,
    #[serde(default)]
    pub environment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox provider tags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxType {
    Mock,
    Container,
    #[serde(rename = "microvm")]
    MicroVm,
    Remote,
}

impl SandboxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Container => "container",
            Self::MicroVm => "microvm",
            Self::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "mock" => Ok(Self::Mock),
            "container" => Ok(Self::Container),
            "microvm" => Ok(Self::MicroVm),
            "remote" => Ok(Self::Remote),
            other => Err(Error::Validation(format!("unknown sandbox type: {other}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An extension the agent should have available; microVM sandboxes install
/// these on the host before the VM starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionRef {
    pub name: String,
    pub git_url: String,
}

/// Named template combining a sandbox provider with provider-specific config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub id: String,
    pub name: String,
    pub sandbox_type: SandboxType,
    /// Container/microVM image reference.
    #[serde(default)]
    pub image: Option<String>,
    /// Resource tier label forwarded to the provider ("small", "large", ...).
    #[serde(default)]
    pub resource_tier: Option<String>,
    /// Base URL of the remote container API (remote provider only).
    #[serde(default)]
    pub remote_endpoint: Option<String>,
    /// Secret injected as the remote provider's auth token.
    #[serde(default)]
    pub secret_id: Option<String>,
    /// Extra environment variables for the sandbox.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Packages the agent installs itself at startup (non-microVM).
    #[serde(default)]
    pub packages: Vec<String>,
    /// Extensions pre-installed on the host (microVM).
    #[serde(default)]
    pub extensions: Vec<ExtensionRef>,
    /// Minutes of inactivity before the reaper pauses the sandbox.
    #[serde(default)]
    pub idle_minutes: Option<u32>,
    /// Minutes of inactivity before the reaper terminates the sandbox.
    #[serde(default)]
    pub terminate_minutes: Option<u32>,
    #[serde(default)]
    pub is_default: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Secrets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretKind {
    AiProvider,
    EnvVar,
    SandboxProvider,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiProvider => "aiProvider",
            Self::EnvVar => "envVar",
            Self::SandboxProvider => "sandboxProvider",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "aiProvider" => Ok(Self::AiProvider),
            "envVar" => Ok(Self::EnvVar),
            "sandboxProvider" => Ok(Self::SandboxProvider),
            other => Err(Error::Validation(format!("unknown secret kind: {other}"))),
        }
    }

    /// Project a secret id onto its environment-variable name.
    ///
    /// `envVar` ids are the variable name verbatim; provider secrets get a
    /// conventional suffix. Ids are uppercased with non-alphanumerics
    /// mapped to `_`.
    pub fn env_var_name(&self, id: &str) -> String {
        match self {
            Self::EnvVar => id.to_string(),
            Self::AiProvider => format!("{}_API_KEY", sanitize_env_id(id)),
            Self::SandboxProvider => format!("{}_TOKEN", sanitize_env_id(id)),
        }
    }
}

fn sanitize_env_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Non-sensitive secret metadata returned by list endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SecretSummary {
    pub id: String,
    pub kind: SecretKind,
    pub enabled: bool,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
