//! Sandbox manager: provider dispatch, live-handle registry, per-session
//! log rings, and the secrets snapshot.
//!
//! Secrets are snapshot-at-start: `set_secrets` replaces the snapshot used
//! by the *next* creation and never reaches sandboxes that are already
//! running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use ar_domain::config::SandboxConfig;
use ar_domain::error::{Error, Result};
use ar_domain::session::{
    EnvironmentConfig, SandboxType, SecretKind, Session, SessionMode,
};

use crate::channel::SandboxChannel;
use crate::log_ring::LogRing;
use crate::providers::{
    ContainerSandbox, CreateSandboxOptions, MicroVmSandbox, MockSandbox, RemoteSandbox,
    SandboxHandle,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session directories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Host-side directory layout for one session:
///
/// ```text
/// <state>/sessions/<id>/
///   workspace/   mounted into the sandbox at /workspace
///   agent/       settings.json, extensions/, sessions/
///   git/         credential helper, git config
/// ```
#[derive(Debug, Clone)]
pub struct SessionDirs {
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub agent: PathBuf,
    pub git: PathBuf,
}

impl SessionDirs {
    /// Create (or reuse) the layout under `state_dir`.
    pub fn ensure(state_dir: &Path, session_id: &str) -> Result<Self> {
        let root = state_dir.join("sessions").join(session_id);
        let dirs = Self {
            workspace: root.join("workspace"),
            agent: root.join("agent"),
            git: root.join("git"),
            root,
        };
        for dir in [
            &dirs.workspace,
            &dirs.agent.join("extensions"),
            &dirs.agent.join("sessions"),
            &dirs.git,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(dirs)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SandboxManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SandboxManager {
    config: SandboxConfig,
    state_dir: PathBuf,
    /// Live handles, one per session.
    handles: Mutex<HashMap<String, Arc<SandboxHandle>>>,
    /// Per-session stderr rings. Survive handle teardown for debugging.
    rings: Mutex<HashMap<String, LogRing>>,
    /// Env snapshot injected into the next sandbox creation.
    secrets: RwLock<HashMap<String, String>>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, state_dir: PathBuf) -> Self {
        Self {
            config,
            state_dir,
            handles: Mutex::new(HashMap::new()),
            rings: Mutex::new(HashMap::new()),
            secrets: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the snapshot used by future creations. Running sandboxes are
    /// unaffected.
    pub fn set_secrets(&self, secrets: HashMap<String, String>) {
        tracing::info!(count = secrets.len(), "secrets snapshot updated");
        *self.secrets.write() = secrets;
    }

    pub fn log_ring(&self, session_id: &str) -> LogRing {
        self.rings
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Snapshot of a session's recent stderr lines.
    pub fn logs(&self, session_id: &str) -> Vec<String> {
        self.log_ring(session_id).snapshot()
    }

    pub fn session_dirs(&self, session_id: &str) -> Result<SessionDirs> {
        SessionDirs::ensure(&self.state_dir, session_id)
    }

    pub fn handle_for(&self, session_id: &str) -> Option<Arc<SandboxHandle>> {
        self.handles.lock().get(session_id).cloned()
    }

    /// Create a fresh sandbox for a session. Chat sessions always get the
    /// mock provider; otherwise the environment decides.
    pub async fn create_for_session(
        &self,
        session: &Session,
        env_cfg: Option<&EnvironmentConfig>,
        mut opts: CreateSandboxOptions,
    ) -> Result<Arc<SandboxHandle>> {
        let provider = self.provider_for(session, env_cfg);
        let ring = self.log_ring(&session.id);
        ring.push(format!(
            "creating sandbox (provider={})",
            provider.as_str()
        ));

        opts.session_id = session.id.clone();
        self.merge_snapshot(&mut opts, env_cfg);
        let dirs = self.session_dirs(&session.id)?;

        let result = match provider {
            SandboxType::Mock => Ok(SandboxHandle::Mock(MockSandbox::create(&session.id))),
            SandboxType::Container => {
                ContainerSandbox::create(&self.config, env_cfg, &opts, &dirs, ring.clone())
                    .await
                    .map(SandboxHandle::Container)
            }
            SandboxType::MicroVm => {
                MicroVmSandbox::create(&self.config, env_cfg, &opts, &dirs, ring.clone())
                    .await
                    .map(SandboxHandle::MicroVm)
            }
            SandboxType::Remote => {
                let env_cfg = env_cfg.ok_or_else(|| {
                    Error::Validation("remote sandbox requires an environment".into())
                })?;
                let token = self.remote_token(env_cfg, &opts);
                RemoteSandbox::create(&self.config, env_cfg, &opts, token, ring.clone())
                    .await
                    .map(SandboxHandle::Remote)
            }
        };

        match result {
            Ok(handle) => {
                let handle = Arc::new(handle);
                ring.push(format!("sandbox ready (id={})", handle.provider_id()));
                self.handles
                    .lock()
                    .insert(session.id.clone(), handle.clone());
                Ok(handle)
            }
            Err(e) => {
                ring.push(format!("sandbox creation failed: {e}"));
                Err(e)
            }
        }
    }

    /// Rebuild a handle from persisted provider ids (relay restart, or
    /// activation after an idle pause) and resume the underlying sandbox.
    pub async fn resume_session(
        &self,
        session: &Session,
        env_cfg: Option<&EnvironmentConfig>,
    ) -> Result<Arc<SandboxHandle>> {
        let sandbox_type = session
            .sandbox_type
            .ok_or_else(|| Error::Provisioning("session has no sandbox to resume".into()))?;
        let provider_id = session
            .sandbox_id
            .as_deref()
            .ok_or_else(|| Error::Provisioning("session has no sandbox id".into()))?;
        let ring = self.log_ring(&session.id);
        ring.push(format!("resuming sandbox (id={provider_id})"));

        let handle = match sandbox_type {
            SandboxType::Mock => SandboxHandle::Mock(MockSandbox::from_id(provider_id)),
            SandboxType::Container => SandboxHandle::Container(ContainerSandbox::from_id(
                &self.config,
                provider_id,
                env_cfg,
                ring.clone(),
            )),
            SandboxType::MicroVm => SandboxHandle::MicroVm(MicroVmSandbox::from_id(
                &self.config,
                provider_id,
                env_cfg,
                ring.clone(),
            )),
            SandboxType::Remote => {
                let token = env_cfg.and_then(|cfg| {
                    let opts = CreateSandboxOptions {
                        secrets: self.secrets.read().clone(),
                        ..Default::default()
                    };
                    self.remote_token(cfg, &opts)
                });
                SandboxHandle::Remote(RemoteSandbox::from_id(
                    &self.config,
                    provider_id,
                    env_cfg,
                    token,
                    ring.clone(),
                )?)
            }
        };

        handle.resume().await?;
        ring.push("sandbox resumed".to_string());
        let handle = Arc::new(handle);
        self.handles
            .lock()
            .insert(session.id.clone(), handle.clone());
        Ok(handle)
    }

    /// Open the RPC channel for a session's live sandbox.
    pub async fn attach_session(&self, session_id: &str) -> Result<SandboxChannel> {
        let handle = self
            .handle_for(session_id)
            .ok_or_else(|| Error::NotFound(format!("no live sandbox for session {session_id}")))?;
        let ring = self.log_ring(session_id);
        ring.push("attaching channel".to_string());
        let channel = handle.attach().await?;
        ring.push("channel attached".to_string());
        Ok(channel)
    }

    /// Pause a session's sandbox. A missing handle is rebuilt (without
    /// starting anything) so the reaper can pause sandboxes it never
    /// attached to.
    pub async fn pause_session(
        &self,
        session: &Session,
        env_cfg: Option<&EnvironmentConfig>,
    ) -> Result<()> {
        let handle = match self.handle_for(&session.id) {
            Some(h) => h,
            None => {
                let handle = self.resume_handle_only(session, env_cfg)?;
                self.handles
                    .lock()
                    .insert(session.id.clone(), handle.clone());
                handle
            }
        };
        self.log_ring(&session.id).push("pausing sandbox".into());
        handle.pause().await
    }

    /// Terminate and forget a session's sandbox.
    pub async fn terminate_session(
        &self,
        session: &Session,
        env_cfg: Option<&EnvironmentConfig>,
    ) -> Result<()> {
        let handle = match self.handle_for(&session.id) {
            Some(h) => h,
            None => {
                // No live handle; rebuild one from the persisted ids just to
                // issue the terminate.
                if session.sandbox_id.is_none() {
                    return Ok(());
                }
                match self.resume_handle_only(session, env_cfg) {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::warn!(session_id = %session.id, error = %e,
                            "cannot rebuild handle for terminate");
                        return Ok(());
                    }
                }
            }
        };
        self.log_ring(&session.id).push("terminating sandbox".into());
        let result = handle.terminate().await;
        self.handles.lock().remove(&session.id);
        result
    }

    /// Drop the in-memory handle without touching the sandbox.
    pub fn forget_session(&self, session_id: &str) {
        self.handles.lock().remove(session_id);
        self.rings.lock().remove(session_id);
    }

    // ── Internals ────────────────────────────────────────────────────

    fn provider_for(
        &self,
        session: &Session,
        env_cfg: Option<&EnvironmentConfig>,
    ) -> SandboxType {
        if session.mode == SessionMode::Chat {
            return SandboxType::Mock;
        }
        env_cfg.map(|e| e.sandbox_type).unwrap_or(SandboxType::Mock)
    }

    /// Copy the current snapshot into the options, without overriding
    /// anything the caller set explicitly, then layer environment vars.
    /// The repository reference is projected into env so the agent can
    /// clone it from inside the sandbox.
    fn merge_snapshot(
        &self,
        opts: &mut CreateSandboxOptions,
        env_cfg: Option<&EnvironmentConfig>,
    ) {
        let snapshot = self.secrets.read();
        for (key, value) in snapshot.iter() {
            opts.secrets
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if let Some(cfg) = env_cfg {
            for (key, value) in &cfg.env {
                opts.env.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if let Some(url) = opts.repository_url.clone() {
            opts.env.entry("REPOSITORY_URL".into()).or_insert(url);
        }
        if let Some(branch) = opts.repository_branch.clone() {
            opts.env.entry("REPOSITORY_BRANCH".into()).or_insert(branch);
        }
    }

    fn remote_token(
        &self,
        env_cfg: &EnvironmentConfig,
        opts: &CreateSandboxOptions,
    ) -> Option<String> {
        let secret_id = env_cfg.secret_id.as_deref()?;
        let var = SecretKind::SandboxProvider.env_var_name(secret_id);
        opts.secrets.get(&var).cloned()
    }

    fn resume_handle_only(
        &self,
        session: &Session,
        env_cfg: Option<&EnvironmentConfig>,
    ) -> Result<Arc<SandboxHandle>> {
        let sandbox_type = session
            .sandbox_type
            .ok_or_else(|| Error::Provisioning("no sandbox type".into()))?;
        let provider_id = session
            .sandbox_id
            .as_deref()
            .ok_or_else(|| Error::Provisioning("no sandbox id".into()))?;
        let ring = self.log_ring(&session.id);
        let handle = match sandbox_type {
            SandboxType::Mock => SandboxHandle::Mock(MockSandbox::from_id(provider_id)),
            SandboxType::Container => SandboxHandle::Container(ContainerSandbox::from_id(
                &self.config,
                provider_id,
                env_cfg,
                ring,
            )),
            SandboxType::MicroVm => SandboxHandle::MicroVm(MicroVmSandbox::from_id(
                &self.config,
                provider_id,
                env_cfg,
                ring,
            )),
            SandboxType::Remote => SandboxHandle::Remote(RemoteSandbox::from_id(
                &self.config,
                provider_id,
                env_cfg,
                None,
                ring,
            )?),
        };
        Ok(Arc::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_session(id: &str, mode: SessionMode) -> Session {
        let now = Utc::now();
        Session {
            id: id.into(),
            mode,
            status: ar_domain::session::SessionStatus::Creating,
            repository_url: None,
            repository_branch: None,
            workspace_path: None,
            last_activity_at: now,
            sandbox_type: None,
            sandbox_id: None,
            data_dir: String::new(),
            environment_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn make_manager(state_dir: &Path) -> SandboxManager {
        SandboxManager::new(SandboxConfig::default(), state_dir.to_path_buf())
    }

    #[tokio::test]
    async fn chat_sessions_get_the_mock_provider() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let session = make_session("s1", SessionMode::Chat);

        let handle = manager
            .create_for_session(&session, None, CreateSandboxOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.provider_type(), SandboxType::Mock);
        assert!(manager.handle_for("s1").is_some());
    }

    #[tokio::test]
    async fn session_dirs_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let dirs = manager.session_dirs("s1").unwrap();
        assert!(dirs.workspace.is_dir());
        assert!(dirs.agent.join("extensions").is_dir());
        assert!(dirs.agent.join("sessions").is_dir());
        assert!(dirs.git.is_dir());
    }

    #[tokio::test]
    async fn secrets_snapshot_is_per_creation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        manager.set_secrets(HashMap::from([("K".to_string(), "v1".to_string())]));

        let mut captured = CreateSandboxOptions::default();
        manager.merge_snapshot(&mut captured, None);
        assert_eq!(captured.secrets.get("K").map(String::as_str), Some("v1"));

        // Update after the snapshot was taken: the captured copy is frozen.
        manager.set_secrets(HashMap::from([("K".to_string(), "v2".to_string())]));
        assert_eq!(captured.secrets.get("K").map(String::as_str), Some("v1"));

        let mut fresh = CreateSandboxOptions::default();
        manager.merge_snapshot(&mut fresh, None);
        assert_eq!(fresh.secrets.get("K").map(String::as_str), Some("v2"));
    }

    #[tokio::test]
    async fn terminate_without_sandbox_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let session = make_session("s1", SessionMode::Code);
        manager.terminate_session(&session, None).await.unwrap();
    }

    #[tokio::test]
    async fn logs_survive_handle_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let manager = make_manager(dir.path());
        let session = make_session("s1", SessionMode::Chat);
        manager
            .create_for_session(&session, None, CreateSandboxOptions::default())
            .await
            .unwrap();

        let mut persisted = session.clone();
        persisted.sandbox_type = Some(SandboxType::Mock);
        persisted.sandbox_id = Some("mock-s1".into());
        manager
            .terminate_session(&persisted, None)
            .await
            .unwrap();

        let logs = manager.logs("s1");
        assert!(logs.iter().any(|l| l.contains("creating sandbox")));
        assert!(logs.iter().any(|l| l.contains("terminating sandbox")));
    }
}
