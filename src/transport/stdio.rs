//! Child-process stdio backend transport.
//!
//! Launches the backend as a child process, writes host frames to its
//! stdin, and reads line-delimited JSON-RPC frames from its stdout. Child
//! stderr is piped to the proxy's logger at `info`.

use crate::error::{ProxyError, ProxyResult};
use crate::transport::{Frame, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;

const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

/// Stdio backend transport. stdout lines are read by a background task and
/// forwarded over a channel so `receive()` never blocks the writer.
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    lines: mpsc::UnboundedReceiver<ProxyResult<String>>,
    _stderr_task: tokio::task::JoinHandle<()>,
    _stdout_task: tokio::task::JoinHandle<()>,
    closed: bool,
}

impl StdioTransport {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
    ) -> ProxyResult<Self> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(ProxyError::Io)?;
        let stdin = child.stdin.take().ok_or_else(|| ProxyError::internal("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| ProxyError::internal("no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| ProxyError::internal("no stderr"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) if line.len() > MAX_LINE_SIZE => {
                        let _ = tx.send(Err(ProxyError::ScannerError("line exceeded max size".into())));
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                        if !trimmed.is_empty() && tx.send(Ok(trimmed)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(ProxyError::Io(e)));
                        break;
                    }
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            while let Ok(n) = reader.read_line(&mut line).await {
                if n == 0 {
                    break;
                }
                tracing::info!(target: "backend.stderr", "{}", line.trim_end());
                line.clear();
            }
        });

        Ok(Self {
            child,
            stdin,
            lines: rx,
            _stderr_task: stderr_task,
            _stdout_task: stdout_task,
            closed: false,
        })
    }

    /// Whether the child process has already exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        if self.closed {
            return Err(ProxyError::TransportClosed("stdio backend".into()));
        }
        self.stdin.write_all(bytes).await.map_err(ProxyError::Io)?;
        self.stdin.write_all(b"\n").await.map_err(ProxyError::Io)?;
        self.stdin.flush().await.map_err(ProxyError::Io)?;
        Ok(())
    }

    async fn receive(&mut self) -> ProxyResult<Frame> {
        match self.lines.recv().await {
            Some(Ok(line)) => Ok(Frame::Data(Bytes::from(line))),
            Some(Err(e)) => Err(e),
            None => {
                self.closed = true;
                Ok(Frame::Eof)
            }
        }
    }

    async fn close(&mut self) -> ProxyResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        Ok(())
    }

    fn supports_server_to_client(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_a_single_json_line() {
        let mut transport = StdioTransport::spawn("cat", &[], &HashMap::new(), None)
            .expect("spawn cat");
        transport.send(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await.unwrap();
        let frame = transport.receive().await.unwrap();
        match frame {
            Frame::Data(bytes) => {
                assert_eq!(bytes.as_ref(), br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
            }
            Frame::Eof => panic!("expected data"),
        }
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn exit_yields_eof() {
        let mut transport = StdioTransport::spawn("true", &[], &HashMap::new(), None)
            .expect("spawn true");
        let frame = transport.receive().await.unwrap();
        assert!(matches!(frame, Frame::Eof));
    }
}
