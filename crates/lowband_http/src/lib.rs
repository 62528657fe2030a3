pub mod compression;
pub mod request;
pub mod transport;

pub use compression::{DecodeError, Negotiator};
pub use request::{ProxyEndpoint, RequestDescriptor, ResourceType, UpstreamRequest, UpstreamResponse};
pub use transport::{ReqwestTransport, Transport, TransportError};
