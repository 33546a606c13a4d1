pub mod access;
pub mod bootstrap;
pub mod conductor;
pub mod upstream;

pub use access::{AccessManager, AccessOutcome, AccessProvider, MemoryApiKeyProvider};
pub use bootstrap::{BootstrapOutcome, CallerStreamChunk, drive_stream};
pub use conductor::{Conductor, RequestOutcome};
pub use upstream::{ReqwestTransport, ResponseClass, TransportError, UpstreamResponse, UpstreamTransport, classify};
