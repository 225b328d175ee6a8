pub mod anthropic;
pub mod auth;
pub mod cache;
pub mod connection_pool;
pub mod google;
pub mod local;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use auth::{build_auth_headers, AuthError, AuthScheme};
pub use cache::{CacheConfig, CacheKey, CacheStats, ResponseCache};
pub use connection_pool::{host_key, spawn_cleanup_task, ConnectionPool, ConnectionPoolConfig, PoolStats};
pub use google::GoogleAdapter;
pub use local::LocalAdapter;
pub use openai::OpenAiCompatibleAdapter;
