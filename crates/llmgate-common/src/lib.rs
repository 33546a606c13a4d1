//! Shared types for the llmgate gateway: wire-format tags, the per-request
//! value object, the inbound principal, gateway-wide config, and the error
//! taxonomy every other crate reports through.

pub mod config;
pub mod error;
pub mod proto;
pub mod route;

pub use config::{GatewayConfig, GatewayConfigPatch, RoutingStrategy};
pub use error::GatewayError;
pub use proto::{CallerFormat, Op};
pub use route::{Principal, RouteRequest, ThinkingSuffix, parse_thinking_suffix};
