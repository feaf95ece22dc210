//! Plain HTTP request/response backend transport.

use crate::error::{ProxyError, ProxyResult};
use crate::transport::sse::normalize_sse_payload;
use crate::transport::{Frame, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;

/// HTTP backend transport. `receive()` drains a queue of buffered response
/// bodies produced by prior `send()` calls — request/response HTTP has no
/// unsolicited server-to-client channel.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    bearer: Option<SecretString>,
    headers: Vec<(String, String)>,
    session_id: Option<String>,
    pending: VecDeque<Bytes>,
    closed: bool,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, bearer: Option<SecretString>, headers: Vec<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            url: url.into(),
            bearer,
            headers,
            session_id: None,
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        if self.closed {
            return Err(ProxyError::TransportClosed(self.url.clone()));
        }
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", crate::protocol::MCP_PROTOCOL_VERSION)
            .body(bytes.to_vec());
        if let Some(secret) = &self.bearer {
            req = req.bearer_auth(secret.expose_secret());
        }
        if let Some(sid) = &self.session_id {
            req = req.header("MCP-Session-Id", sid.clone());
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::timeout("http send", 30_000)
            } else {
                ProxyError::TransportClosed(e.to_string())
            }
        })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProxyError::SessionLost(self.url.clone()));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(sid) = resp.headers().get("MCP-Session-Id") {
            if let Ok(sid) = sid.to_str() {
                self.session_id = Some(sid.to_string());
            }
        }

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProxyError::ScannerError(e.to_string()))?;

        if !status.is_success() {
            return Err(ProxyError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        let normalized = normalize_sse_payload(&body, content_type.as_deref());
        self.pending.push_back(Bytes::from(normalized));
        Ok(())
    }

    async fn receive(&mut self) -> ProxyResult<Frame> {
        match self.pending.pop_front() {
            Some(bytes) => Ok(Frame::Data(bytes)),
            None if self.closed => Ok(Frame::Eof),
            None => Ok(Frame::Eof),
        }
    }

    async fn close(&mut self) -> ProxyResult<()> {
        self.closed = true;
        Ok(())
    }

    fn supports_server_to_client(&self) -> bool {
        false
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_transport_rejects_send() {
        // constructed directly to avoid a real network call in unit tests
        let mut t = HttpTransport::new("http://127.0.0.1:0/mcp", None, vec![]);
        t.closed = true;
        let result = futures::executor::block_on(t.send(b"{}"));
        assert!(matches!(result, Err(ProxyError::TransportClosed(_))));
    }
}
