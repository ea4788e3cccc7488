pub mod hashing;

pub use hashing::{hash_code, verify_code, OneTimeCode};
