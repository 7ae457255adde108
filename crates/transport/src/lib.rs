//! Request executor abstraction for guarded upstream clients
//!
//! Defines the `Transport` trait: a single-method executor that performs one
//! HTTP round trip. Decorators (such as the auth guard) wrap a base transport
//! and implement the same trait, so callers hold an `Arc<dyn Transport>` and
//! never care how many layers sit underneath.
//!
//! `ReqwestTransport` is the default executor used when no base is supplied.

pub mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use std::future::Future;
use std::pin::Pin;

/// Type-erased transport-level error (no HTTP response was produced).
///
/// Decorators may substitute their own error types; callers recover the
/// concrete kind with `downcast_ref` or by walking `source()`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for a single round trip.
pub type Result<T> = std::result::Result<T, BoxError>;

/// Boxed future returned by `Transport::execute`.
pub type ResponseFuture<'a> = Pin<Box<dyn Future<Output = Result<reqwest::Response>> + Send + 'a>>;

/// Performs one HTTP round trip.
///
/// Returns `Ok` for any HTTP response, including 4xx/5xx. `Err` means the
/// request never produced a response (DNS, connect, TLS, credential plugin
/// failures, or a decorator refusing to send).
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn execute(&self, request: reqwest::Request) -> ResponseFuture<'_>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn execute(&self, request: reqwest::Request) -> ResponseFuture<'_> {
        (**self).execute(request)
    }
}

/// Flatten an error and its `source()` chain into one `": "`-joined string.
///
/// `reqwest::Error`'s `Display` omits the underlying cause, so the text a
/// credential plugin wrote ("getting credentials: exec: ...") only appears
/// further down the chain. Adjacent duplicates are collapsed.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts: Vec<String> = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        let text = source.to_string();
        if parts.last().is_none_or(|last| !last.contains(&text)) {
            parts.push(text);
        }
        current = source.source();
    }
    parts.join(": ")
}
