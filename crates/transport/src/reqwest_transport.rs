//! Default executor backed by `reqwest::Client`.
//!
//! Performs the round trip with no interpretation of the result: every HTTP
//! status is an `Ok` response, and only failures that prevent a response
//! (connect, TLS, timeout, body setup) surface as errors.

use crate::{ResponseFuture, Transport};
use tracing::debug;

/// Transport that hands requests straight to a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// The underlying client, for building requests that this transport will execute.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Transport for ReqwestTransport {
    fn execute(&self, request: reqwest::Request) -> ResponseFuture<'_> {
        Box::pin(async move {
            debug!(method = %request.method(), url = %request.url(), "executing upstream request");
            let response = self.client.execute(request).await?;
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP/1.1 response on an ephemeral port.
    async fn one_shot_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!("HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn returns_response_for_success_status() {
        let url = one_shot_server("200 OK").await;
        let transport = ReqwestTransport::default();
        let request = transport.client().get(format!("{url}/version")).build().unwrap();

        let response = transport.execute(request).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let url = one_shot_server("401 Unauthorized").await;
        let transport = ReqwestTransport::default();
        let request = transport.client().get(format!("{url}/api")).build().unwrap();

        let response = transport.execute(request).await.unwrap();
        assert_eq!(response.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let transport = ReqwestTransport::new(reqwest::Client::new());
        let request = transport
            .client()
            .get("http://127.0.0.1:1/unreachable")
            .build()
            .unwrap();

        let result = transport.execute(request).await;
        assert!(result.is_err(), "unreachable upstream must yield a transport error");
    }
}
