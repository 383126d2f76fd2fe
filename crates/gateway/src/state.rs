use std::sync::Arc;

use ar_crypto::CryptoService;
use ar_domain::config::Config;
use ar_sandbox::SandboxManager;
use ar_store::Store;

use crate::hub::HubRegistry;

/// Shared application state passed to all API handlers.
///
/// Everything here is a stateless service or a registry guarded by its own
/// locks; per-session state lives inside each hub.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub crypto: Arc<CryptoService>,
    pub manager: Arc<SandboxManager>,
    pub hubs: Arc<HubRegistry>,
}
