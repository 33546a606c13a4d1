use std::sync::Arc;

use llmgate_conductor::{AccessManager, Conductor, ReqwestTransport};

pub struct AppState {
    pub conductor: Arc<Conductor<ReqwestTransport>>,
    pub access: Arc<AccessManager>,
}

pub type SharedState = Arc<AppState>;
