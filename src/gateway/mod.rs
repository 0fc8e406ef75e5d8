//! Request execution: the executor, its builder and its admin handle.

mod admin;
mod builder;
mod executor;
mod retry;

pub use admin::AdminHandle;
pub use builder::{Heimdall, HeimdallBuilder};
pub use executor::{EndpointPolicy, ExecutorStats, RequestExecutor};
pub use retry::RetryPolicy;
