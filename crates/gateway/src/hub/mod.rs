//! Per-session multiplexing between one sandbox channel and N clients.

mod session_hub;

pub use session_hub::{ActivateInfo, ReplayPlan, SessionHub};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ar_domain::config::Config;
use ar_sandbox::SandboxManager;
use ar_store::Store;

/// Registry of live hubs, one per session id.
pub struct HubRegistry {
    hubs: Mutex<HashMap<String, Arc<SessionHub>>>,
    store: Arc<Store>,
    manager: Arc<SandboxManager>,
    config: Arc<Config>,
}

impl HubRegistry {
    pub fn new(store: Arc<Store>, manager: Arc<SandboxManager>, config: Arc<Config>) -> Self {
        Self {
            hubs: Mutex::new(HashMap::new()),
            store,
            manager,
            config,
        }
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<SessionHub> {
        self.hubs
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionHub::new(
                    session_id.to_string(),
                    self.store.clone(),
                    self.manager.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHub>> {
        self.hubs.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHub>> {
        self.hubs.lock().remove(session_id)
    }

    /// Relay shutdown: stop accepting work, drain writers briefly, close
    /// every channel.
    pub async fn shutdown_all(&self, drain: Duration) {
        let hubs: Vec<Arc<SessionHub>> = self.hubs.lock().values().cloned().collect();
        for hub in hubs {
            hub.graceful_shutdown(drain).await;
        }
        self.hubs.lock().clear();
    }
}
