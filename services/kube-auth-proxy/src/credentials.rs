//! Bearer token injection for upstream requests
//!
//! `BearerTransport` sits between the auth guard and the raw reqwest
//! transport. The token comes from `KUBE_TOKEN` (fixed for the process) or
//! from a token file that is re-read on every request, so an external
//! rotator (projected service account tokens, `kubelogin`, a sidecar) can
//! replace it and the next recovery probe picks it up.

use std::path::PathBuf;
use std::sync::Arc;

use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use transport::{ResponseFuture, Transport};

use crate::error::{Error, Result};

/// Where the upstream bearer token comes from.
#[derive(Debug, Clone, Default)]
pub enum TokenSource {
    /// Forward requests without an Authorization header.
    #[default]
    None,
    Static(Secret<String>),
    File(PathBuf),
}

impl TokenSource {
    /// Resolve the token to send right now.
    pub async fn current(&self) -> Result<Option<Secret<String>>> {
        match self {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| Error::TokenFile {
                        path: path.clone(),
                        source,
                    })?;
                Secret::from_trimmed(&raw)
                    .map(Some)
                    .ok_or_else(|| Error::EmptyToken { path: path.clone() })
            }
        }
    }
}

/// Transport that sets `Authorization: Bearer <token>` before delegating.
///
/// Token resolution failures surface as transport errors, before any bytes
/// are sent, exactly like an exec credential plugin failing.
pub struct BearerTransport {
    inner: Arc<dyn Transport>,
    tokens: TokenSource,
}

impl BearerTransport {
    pub fn new(inner: Arc<dyn Transport>, tokens: TokenSource) -> Self {
        Self { inner, tokens }
    }
}

impl Transport for BearerTransport {
    fn execute(&self, mut request: reqwest::Request) -> ResponseFuture<'_> {
        Box::pin(async move {
            if let Some(token) = self.tokens.current().await? {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                    .map_err(|e| Error::InvalidToken(e.to_string()))?;
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            self.inner.execute(request).await
        })
    }
}
