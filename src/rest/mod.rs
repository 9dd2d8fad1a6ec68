pub mod client;
pub mod ratelimit;
pub mod route;

pub use client::{GatewayBot, RestClient};
pub use ratelimit::{Bucket, RateLimitHeaders, RateLimiter};
pub use route::Route;
