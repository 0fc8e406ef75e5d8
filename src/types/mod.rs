//! Public types for the Heimdall API.

mod descriptor;
mod endpoint;
mod payload;

pub use descriptor::{Parameters, RequestDescriptor, UpstreamRequest};
pub use endpoint::{EndpointClass, Host, ParamKind, ParamSpec};
pub use payload::Payload;
