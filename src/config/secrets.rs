//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for the API token.

pub use secrecy::{ExposeSecret, SecretString};
