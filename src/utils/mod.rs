pub mod retry;

pub use retry::{retry_on_conflict, RetryConfig};
