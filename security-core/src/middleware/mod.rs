pub mod session;
pub mod waf;

pub use session::{csrf_middleware, session_middleware, CurrentSession};
pub use waf::{blocked_response, waf_middleware};
