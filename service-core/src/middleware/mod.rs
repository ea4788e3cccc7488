pub mod security_headers;
pub mod tracing;

pub use self::security_headers::{SecurityHeaders, security_headers_middleware};
pub use self::tracing::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
