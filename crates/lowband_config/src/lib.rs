mod cache;
mod http;
mod lowband;
mod pipeline;
mod policy;
mod proxy;
pub mod validation;

pub use cache::CacheConfig;
pub use http::{CompressionConfig, TransportConfig};
pub use lowband::LowbandConfig;
pub use pipeline::{DedupConfig, RetryConfig};
pub use policy::{KNOWN_RESOURCE_TYPES, PolicyConfig, RuleAction, RuleConfig};
pub use proxy::{ProxyConfig, ProxyEndpointConfig, ProxyHealthConfig};
pub use validation::ConfigReport;
