//! SSE-framed HTTP backend transport.
//!
//! Accepts `application/json, text/event-stream`. The body is read by a
//! line-oriented scanner collecting `event:`, `id:`, `data:`, `retry:`
//! fields, ignoring a single leading `: priming` comment. For every
//! complete event the concatenated `data` payload is enqueued.

use crate::error::{ProxyError, ProxyResult};
use crate::transport::{Frame, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// One parsed SSE event.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

/// Incrementally parses raw bytes into complete SSE events, matching the
/// line-oriented scanner contract: `event:`, `id:`, `data:`, `retry:`
/// fields, blank line terminates an event, `: ` lines are comments.
#[derive(Debug, Default)]
pub struct SseScanner {
    buffer: String,
    current: SseEvent,
    have_data: bool,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns any complete events parsed so far.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            if line.is_empty() {
                if self.have_data {
                    out.push(std::mem::take(&mut self.current));
                    self.have_data = false;
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix(": ") {
                let _ = rest; // priming comment, ignored
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                self.current.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("id:") {
                self.current.id = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                if self.have_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value.trim_start());
                self.have_data = true;
            } else if let Some(value) = line.strip_prefix("retry:") {
                self.current.retry = value.trim_start().parse().ok();
            }
        }
        out
    }
}

/// Normalizes a POST response body: if it carries `text/event-stream`
/// content-type, or itself starts with `event:`/`data:`, the body is parsed
/// and the concatenated `data:` payload replaces it. Otherwise the body is
/// returned unchanged.
pub fn normalize_sse_payload(body: &str, content_type: Option<&str>) -> String {
    let looks_like_sse = content_type
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
        || body.starts_with("event:")
        || body.starts_with("data:");
    if !looks_like_sse {
        return body.to_string();
    }
    let mut scanner = SseScanner::new();
    let mut events = scanner.feed(body.as_bytes());
    if events.is_empty() && scanner.have_data {
        events.push(std::mem::take(&mut scanner.current));
    }
    events
        .into_iter()
        .map(|e| e.data)
        .collect::<Vec<_>>()
        .join("\n")
}

/// SSE backend transport. The scanner runs as its own worker task reading
/// from the HTTP response body stream; `close()` drops the worker's channel
/// and awaits its join handle.
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
    bearer: Option<SecretString>,
    session_id: Option<String>,
    last_event_id: Option<String>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    worker: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
}

impl SseTransport {
    pub fn new(url: impl Into<String>, bearer: Option<SecretString>) -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer,
            session_id: None,
            last_event_id: None,
            inbound: rx,
            worker: None,
            closed: false,
        }
    }

    fn connect(&mut self) -> ProxyResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound = rx;
        let client = self.client.clone();
        let url = self.url.clone();
        let bearer = self.bearer.clone();
        let last_event_id = self.last_event_id.clone();

        let handle = tokio::spawn(async move {
            let mut req = client
                .get(&url)
                .header("Accept", "application/json, text/event-stream, */*");
            if let Some(secret) = &bearer {
                req = req.bearer_auth(secret.expose_secret());
            }
            if let Some(id) = &last_event_id {
                req = req.header("Last-Event-ID", id.clone());
            }
            let Ok(resp) = req.send().await else { return };
            let mut scanner = SseScanner::new();
            let mut stream = resp.bytes_stream();
            use futures::StreamExt;
            while let Some(Ok(chunk)) = stream.next().await {
                for event in scanner.feed(&chunk) {
                    if tx.send(Bytes::from(event.data)).is_err() {
                        return;
                    }
                }
            }
        });
        self.worker = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        if self.worker.is_none() {
            self.connect()?;
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
        let resp = req
            .send()
            .await
            .map_err(|e| ProxyError::TransportClosed(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProxyError::SessionLost(self.url.clone()));
        }
        if let Some(sid) = resp.headers().get("MCP-Session-Id") {
            if let Ok(sid) = sid.to_str() {
                self.session_id = Some(sid.to_string());
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> ProxyResult<Frame> {
        match self.inbound.recv().await {
            Some(bytes) => Ok(Frame::Data(bytes)),
            None => Ok(Frame::Eof),
        }
    }

    async fn close(&mut self) -> ProxyResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(handle) = self.worker.take() {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }

    fn supports_server_to_client(&self) -> bool {
        true
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

#[allow(dead_code)]
fn drain_into_queue(queue: &mut VecDeque<SseEvent>, events: Vec<SseEvent>) {
    queue.extend(events);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_single_data_line() {
        let body = "event: message\nid: 7\ndata: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{}}\n\n";
        let normalized = normalize_sse_payload(body, None);
        assert_eq!(normalized, r#"{"jsonrpc":"2.0","id":4,"result":{}}"#);
    }

    #[test]
    fn non_sse_body_is_returned_unchanged() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        assert_eq!(normalize_sse_payload(body, None), body);
    }

    #[test]
    fn normalization_is_idempotent_on_plain_json() {
        let body = r#"{"ok":true}"#;
        let once = normalize_sse_payload(body, None);
        let twice = normalize_sse_payload(&once, None);
        assert_eq!(once, twice);
    }

    #[test]
    fn scanner_joins_multi_line_data_with_newline() {
        let mut scanner = SseScanner::new();
        let events = scanner.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn scanner_ignores_priming_comment() {
        let mut scanner = SseScanner::new();
        let events = scanner.feed(b": priming\ndata: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }
}
