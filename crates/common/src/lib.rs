//! Common types for the kube auth guard workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
