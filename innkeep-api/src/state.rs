use std::sync::Arc;
use innkeep_booking::BookingOrchestrator;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BookingOrchestrator>,
    pub auth: AuthConfig,
    /// Gateway publishable key, handed to clients to open the checkout
    pub pub_key: String,
}
