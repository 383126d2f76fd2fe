//! Idle reaper: demotes inactive sessions, pauses their sandboxes, and
//! eventually terminates sandboxes nobody came back for.
//!
//! The reaper holds no locks across its decisions and tolerates sessions
//! transitioning concurrently: a pause may find the sandbox already
//! terminated, a status update may hit a session a client just reactivated.
//! Both are fine: every step is idempotent or conflict-tolerant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ar_domain::config::ReaperConfig;
use ar_domain::error::Error;
use ar_domain::session::{EnvironmentConfig, Session, SessionStatus};
use ar_sandbox::SandboxManager;
use ar_store::Store;

use crate::hub::HubRegistry;

/// Journal retention runs at most this often.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3_600);

pub struct Reaper {
    store: Arc<Store>,
    manager: Arc<SandboxManager>,
    hubs: Arc<HubRegistry>,
    config: ReaperConfig,
    last_prune: Mutex<Option<Instant>>,
}

impl Reaper {
    pub fn new(
        store: Arc<Store>,
        manager: Arc<SandboxManager>,
        hubs: Arc<HubRegistry>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            manager,
            hubs,
            config,
            last_prune: Mutex::new(None),
        }
    }

    /// Timer loop; runs until the shutdown token fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    /// One scan. Public for tests.
    pub async fn tick(&self) {
        self.demote_inactive().await;
        self.terminate_long_idle().await;
        self.prune_journal();
    }

    /// `active` sessions past their idle threshold → `idle` + pause.
    async fn demote_inactive(&self) {
        let sessions = match self.store.list_sessions_by_status(SessionStatus::Active) {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "reaper: listing active sessions failed");
                return;
            }
        };
        let now = Utc::now();

        for session in sessions {
            let env_cfg = self.environment_for(&session);
            let idle_minutes = env_cfg
                .as_ref()
                .and_then(|e| e.idle_minutes)
                .unwrap_or(self.config.default_idle_minutes);
            let inactive = now
                .signed_duration_since(session.last_activity_at)
                .num_minutes();
            if inactive < idle_minutes as i64 {
                continue;
            }

            tracing::info!(
                session_id = %session.id,
                inactive_minutes = inactive,
                threshold = idle_minutes,
                "reaper: demoting idle session"
            );

            // Quiet-detach the hub first so channel EOF isn't mistaken for
            // a failure.
            if let Some(hub) = self.hubs.get(&session.id) {
                hub.detach_channel().await;
            }
            match self
                .store
                .update_session_status(&session.id, SessionStatus::Idle)
            {
                Ok(_) => {}
                // A client reactivated (or archived) mid-tick; leave it be.
                Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "reaper: status update failed");
                    continue;
                }
            }
            if let Err(e) = self
                .manager
                .pause_session(&session, env_cfg.as_ref())
                .await
            {
                // Already stopped or gone is fine; anything else is logged.
                tracing::warn!(session_id = %session.id, error = %e, "reaper: pause failed");
            }
        }
    }

    /// `idle` sessions past the terminate threshold lose their sandbox.
    /// The session stays `idle`; the next activate re-creates.
    async fn terminate_long_idle(&self) {
        let sessions = match self.store.list_sessions_by_status(SessionStatus::Idle) {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "reaper: listing idle sessions failed");
                return;
            }
        };
        let now = Utc::now();

        for session in sessions {
            if session.sandbox_id.is_none() {
                continue;
            }
            let env_cfg = self.environment_for(&session);
            let terminate_minutes = env_cfg
                .as_ref()
                .and_then(|e| e.terminate_minutes)
                .unwrap_or(self.config.default_terminate_minutes);
            let inactive = now
                .signed_duration_since(session.last_activity_at)
                .num_minutes();
            if inactive < terminate_minutes as i64 {
                continue;
            }

            tracing::info!(
                session_id = %session.id,
                inactive_minutes = inactive,
                "reaper: terminating long-idle sandbox"
            );
            if let Err(e) = self
                .manager
                .terminate_session(&session, env_cfg.as_ref())
                .await
            {
                tracing::warn!(session_id = %session.id, error = %e, "reaper: terminate failed");
                continue;
            }
            if let Err(e) = self.store.set_session_sandbox(&session.id, None, None) {
                tracing::warn!(session_id = %session.id, error = %e, "reaper: clearing sandbox binding failed");
            }
        }
    }

    /// Journal retention sweep, at most once per [`PRUNE_INTERVAL`].
    fn prune_journal(&self) {
        {
            let mut last = self.last_prune.lock();
            if let Some(prev) = *last {
                if prev.elapsed() < PRUNE_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        match self.store.prune_events_older_than(cutoff) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "reaper: pruned journal rows"),
            Err(e) => tracing::warn!(error = %e, "reaper: journal prune failed"),
        }
    }

    fn environment_for(&self, session: &Session) -> Option<EnvironmentConfig> {
        session
            .environment_id
            .as_deref()
            .and_then(|id| self.store.get_environment(id).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_domain::config::Config;
    use ar_domain::session::{SandboxType, SessionMode};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        store: Arc<Store>,
        manager: Arc<SandboxManager>,
        reaper: Reaper,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = Arc::new(SandboxManager::new(
            Default::default(),
            dir.path().to_path_buf(),
        ));
        let config = Arc::new(Config::default());
        let hubs = Arc::new(HubRegistry::new(
            store.clone(),
            manager.clone(),
            config.clone(),
        ));
        let reaper = Reaper::new(
            store.clone(),
            manager.clone(),
            hubs,
            config.reaper.clone(),
        );
        Fixture {
            store,
            manager,
            reaper,
            _dir: dir,
        }
    }

    fn seed(store: &Store, id: &str, status: SessionStatus, inactive_minutes: i64) {
        let now = Utc::now();
        store
            .create_session(&ar_domain::session::Session {
                id: id.into(),
                mode: SessionMode::Chat,
                status: SessionStatus::Creating,
                repository_url: None,
                repository_branch: None,
                workspace_path: None,
                last_activity_at: now,
                sandbox_type: None,
                sandbox_id: None,
                data_dir: format!("/tmp/{id}"),
                environment_id: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        if status != SessionStatus::Creating {
            // creating → active (→ idle) is the legal path.
            store
                .update_session_status(id, SessionStatus::Active)
                .unwrap();
            if status != SessionStatus::Active {
                store.update_session_status(id, status).unwrap();
            }
        }
        store
            .set_session_sandbox(id, Some(SandboxType::Mock), Some(&format!("mock-{id}")))
            .unwrap();
        store
            .touch_session_activity(id, now - ChronoDuration::minutes(inactive_minutes))
            .unwrap();
    }

    #[tokio::test]
    async fn active_past_threshold_becomes_idle() {
        let f = fixture();
        seed(&f.store, "old", SessionStatus::Active, 60);
        seed(&f.store, "fresh", SessionStatus::Active, 1);

        f.reaper.tick().await;

        assert_eq!(
            f.store.get_session("old").unwrap().status,
            SessionStatus::Idle
        );
        assert_eq!(
            f.store.get_session("fresh").unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn long_idle_sandbox_is_terminated_but_session_stays_idle() {
        let f = fixture();
        seed(&f.store, "s1", SessionStatus::Idle, 500);

        f.reaper.tick().await;

        let session = f.store.get_session("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.sandbox_id.is_none());
        assert!(f.manager.handle_for("s1").is_none());
    }

    #[tokio::test]
    async fn short_idle_keeps_its_sandbox() {
        let f = fixture();
        seed(&f.store, "s1", SessionStatus::Idle, 60);

        f.reaper.tick().await;

        assert!(f.store.get_session("s1").unwrap().sandbox_id.is_some());
    }

    #[tokio::test]
    async fn untouchable_statuses_are_skipped() {
        let f = fixture();
        seed(&f.store, "err", SessionStatus::Error, 500);
        seed(&f.store, "arch", SessionStatus::Archived, 500);

        f.reaper.tick().await;

        assert_eq!(
            f.store.get_session("err").unwrap().status,
            SessionStatus::Error
        );
        assert_eq!(
            f.store.get_session("arch").unwrap().status,
            SessionStatus::Archived
        );
        // Their sandboxes were not terminated either.
        assert!(f.store.get_session("err").unwrap().sandbox_id.is_some());
    }

    #[tokio::test]
    async fn tick_is_idempotent() {
        let f = fixture();
        seed(&f.store, "s1", SessionStatus::Active, 60);
        f.reaper.tick().await;
        f.reaper.tick().await;
        assert_eq!(
            f.store.get_session("s1").unwrap().status,
            SessionStatus::Idle
        );
    }
}
