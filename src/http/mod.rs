//! Request/response model and the network transport seam.

mod transport;
mod types;

pub use transport::{HttpTransport, Transport, TransportError};
pub use types::{resource_path, ApiRequest, ApiResponse, Headers, HttpMethod, RequestOptions};
