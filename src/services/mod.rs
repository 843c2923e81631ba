pub mod backoff;
pub mod lifecycle_manager;
pub mod registration;
pub mod retry_scheduler;
pub mod token_provider;
pub mod token_store;

pub use backoff::BackoffPolicy;
pub use lifecycle_manager::{DiagnosticsSnapshot, ManagerSettings, TokenLifecycleManager};
pub use registration::RegistrationClient;
pub use retry_scheduler::{AttemptResult, RetryScheduler, RetryState};
pub use token_provider::TokenProvider;
pub use token_store::TokenStore;
