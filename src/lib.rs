pub mod alerts;
pub mod auth;
pub mod browser;
pub mod core;
pub mod scrape;
pub mod session;

// --- Primary core exports ---
pub use core::config::ServiceConfig;
pub use core::types;
pub use core::AppState;

pub use auth::credential_store::CredentialStore;
pub use auth::orchestrator::{RefreshResult, TokenRefreshOrchestrator};
pub use browser::pool::BrowserPool;
pub use scrape::extractor;
pub use session::automator::SessionAutomator;
