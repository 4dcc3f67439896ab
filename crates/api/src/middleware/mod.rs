// Request guards applied by the ingest endpoint.

pub mod auth;
pub mod rate_limit;

pub use auth::verify_api_key;
pub use rate_limit::RateLimiter;
