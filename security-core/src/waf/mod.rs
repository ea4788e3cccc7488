//! Pattern-matching request firewall.
//!
//! Runs before session handling. A match terminates the request with a 403
//! carrying only a short reference code.

pub mod decode;
mod firewall;
pub mod patterns;

pub use firewall::{reference_code, Detection, Firewall, ScanInput, Verdict, WAF_TARGET};
