pub mod credential_store;
pub mod orchestrator;
pub mod pending;
pub mod scheduler;
