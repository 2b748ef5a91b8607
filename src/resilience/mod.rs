pub mod health;
pub mod retry;

pub use health::{BackendHealth, ConnectionStatus};
pub use retry::{retry, RetryConfig};
