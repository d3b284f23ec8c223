pub mod algorithms;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod leaky_bucket;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod router;
pub mod server;
pub mod shard;
pub mod throttler;
pub mod token_bucket;
pub mod validation;

pub use algorithms::Algorithm;
pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use server::create_app;
pub use throttler::{StatusView, Throttler};
