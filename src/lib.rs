pub mod config;
pub mod counters;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod token_bucket;

pub use config::Config;
pub use error::{Error, Result};
pub use identity::ClientIdentity;
pub use rate_limit_config::{QuotaPolicy, RateLimitSettings};
pub use rate_limiter::{Decision, RateLimiter};
pub use server::create_app;
pub use token_bucket::{Admission, TokenBucket};
