//! Vision model bridge.
//!
//! Spawns the model bridge subprocess and talks to it over a JSON-lines
//! stdin/stdout protocol: the bridge announces `ready`, then answers each
//! `describe_image` request with a `result` or an `error`.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tdpflow_shared::{BridgeConfig, Result, TdpFlowError};
use tracing::{info, warn};

use crate::image::VisionModel;

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct VisionTask {
    pub task_type: String,
    pub model: String,
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage {
    #[serde(rename = "describe")]
    Describe { id: String, task: VisionTask },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result { id: String, result: BridgeResult },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BridgeResult {
    pub text: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub model: String,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One side of the JSON-lines conversation.
struct BridgeConnection<W, R> {
    writer: W,
    reader: R,
    request_counter: u64,
}

impl<W: Write, R: BufRead> BridgeConnection<W, R> {
    fn new(writer: W, reader: R) -> Self {
        Self {
            writer,
            reader,
            request_counter: 0,
        }
    }

    fn read_message(&mut self) -> Result<(ResponseMessage, String)> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| TdpFlowError::Bridge(format!("bridge read error: {e}")))?;
        if line.is_empty() {
            return Err(TdpFlowError::Bridge("bridge closed stdout unexpectedly".into()));
        }
        let excerpt: String = line.trim().chars().take(200).collect();
        let msg = serde_json::from_str(line.trim()).map_err(|e| {
            TdpFlowError::Bridge(format!("invalid bridge message: {e} (got: {excerpt})"))
        })?;
        Ok((msg, excerpt))
    }

    fn write_message(&mut self, message: &RequestMessage) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| TdpFlowError::Bridge(format!("failed to serialize request: {e}")))?;
        writeln!(self.writer, "{json}")
            .and_then(|()| self.writer.flush())
            .map_err(|e| TdpFlowError::Bridge(format!("failed to write to bridge stdin: {e}")))
    }

    fn wait_for_ready(&mut self) -> Result<()> {
        match self.read_message()? {
            (ResponseMessage::Ready, _) => {
                info!("bridge is ready");
                Ok(())
            }
            (_, line) => Err(TdpFlowError::Bridge(format!(
                "expected ready message, got: {line}"
            ))),
        }
    }

    fn send_task(&mut self, task: VisionTask) -> Result<BridgeResult> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);
        self.write_message(&RequestMessage::Describe {
            id: id.clone(),
            task,
        })?;

        match self.read_message()? {
            (ResponseMessage::Result { id: resp_id, result }, _) if resp_id == id => Ok(result),
            (ResponseMessage::Result { id: resp_id, .. }, _) => Err(TdpFlowError::Bridge(format!(
                "response id mismatch: expected {id}, got {resp_id}"
            ))),
            (ResponseMessage::Error { error, .. }, _) => Err(TdpFlowError::Bridge(error)),
            (ResponseMessage::Ready, _) => Err(TdpFlowError::Bridge(
                "unexpected ready message during request".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Process handle
// ---------------------------------------------------------------------------

struct BridgeProcess {
    child: Child,
    connection: BridgeConnection<ChildStdin, BufReader<ChildStdout>>,
}

impl BridgeProcess {
    fn spawn(config: &BridgeConfig) -> Result<Self> {
        info!(cmd = %config.cmd, script = %config.script, "spawning model bridge");

        let mut command = Command::new(&config.cmd);
        command
            .arg("run")
            .arg(&config.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if !config.working_dir.is_empty() {
            command.current_dir(&config.working_dir);
        }

        let mut child = command.spawn().map_err(|e| {
            TdpFlowError::Bridge(format!(
                "failed to spawn bridge: {e}. Is `{}` installed?",
                config.cmd
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TdpFlowError::Bridge("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TdpFlowError::Bridge("failed to capture bridge stdout".into()))?;

        let mut process = Self {
            child,
            connection: BridgeConnection::new(stdin, BufReader::new(stdout)),
        };
        process.connection.wait_for_ready()?;
        Ok(process)
    }

    fn shutdown(mut self) {
        let _ = self.connection.write_message(&RequestMessage::Shutdown);
        match self.child.wait() {
            Ok(status) => info!(?status, "bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// VisionModel implementation
// ---------------------------------------------------------------------------

/// [`VisionModel`] backed by the bridge subprocess, spawned on first use.
pub struct BridgeVisionModel {
    config: BridgeConfig,
    process: Arc<Mutex<Option<BridgeProcess>>>,
}

impl BridgeVisionModel {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            process: Arc::new(Mutex::new(None)),
        }
    }

    /// Stop the bridge if it was started.
    pub fn shutdown(&self) {
        let process = match self.process.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(process) = process {
            process.shutdown();
        }
    }
}

impl Drop for BridgeVisionModel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl VisionModel for BridgeVisionModel {
    async fn describe(
        &self,
        media_type: &str,
        image: &[u8],
        instructions: Option<&str>,
    ) -> Result<String> {
        let task = VisionTask {
            task_type: "describe_image".into(),
            model: self.config.model.clone(),
            media_type: media_type.to_string(),
            image: STANDARD.encode(image),
            instructions: instructions.map(String::from),
        };
        let config = self.config.clone();
        let process = Arc::clone(&self.process);

        let result = tokio::task::spawn_blocking(move || -> Result<BridgeResult> {
            let mut guard = process
                .lock()
                .map_err(|_| TdpFlowError::Bridge("bridge lock poisoned".into()))?;
            if guard.is_none() {
                *guard = Some(BridgeProcess::spawn(&config)?);
            }
            let outcome = match guard.as_mut() {
                Some(bridge) => bridge.connection.send_task(task),
                None => Err(TdpFlowError::Bridge("bridge not running".into())),
            };
            if outcome.is_err() {
                // Drop a bridge that may be out of sync; the next call respawns it.
                if let Some(bridge) = guard.take() {
                    bridge.shutdown();
                }
            }
            outcome
        })
        .await
        .map_err(|e| TdpFlowError::Bridge(format!("bridge task panicked: {e}")))??;

        tracing::debug!(
            model = %result.model,
            tokens_in = result.tokens_in,
            tokens_out = result.tokens_out,
            "image described"
        );
        Ok(result.text)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn task() -> VisionTask {
        VisionTask {
            task_type: "describe_image".into(),
            model: "gpt-4o".into(),
            media_type: "image/png".into(),
            image: STANDARD.encode(b"png"),
            instructions: None,
        }
    }

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_value(RequestMessage::Describe {
            id: "req-1".into(),
            task: task(),
        })
        .unwrap();
        assert_eq!(json["type"], "describe");
        assert_eq!(json["task"]["task_type"], "describe_image");
        assert_eq!(json["task"]["image"], "cG5n");
        assert!(json["task"].get("instructions").is_none());

        let shutdown = serde_json::to_string(&RequestMessage::Shutdown).unwrap();
        assert_eq!(shutdown, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn ready_then_result() {
        let replies = concat!(
            r#"{"type":"ready"}"#,
            "\n",
            r#"{"type":"result","id":"req-1","result":{"text":"A chart","tokens_in":5,"tokens_out":2,"model":"m"}}"#,
            "\n"
        );
        let mut conn = BridgeConnection::new(Vec::new(), Cursor::new(replies.as_bytes()));

        conn.wait_for_ready().unwrap();
        let result = conn.send_task(task()).unwrap();

        assert_eq!(result.text, "A chart");
        let sent = String::from_utf8(conn.writer).unwrap();
        assert!(sent.starts_with(r#"{"type":"describe","id":"req-1""#));
        assert!(sent.ends_with('\n'));
    }

    #[test]
    fn error_reply_and_closed_stream() {
        let replies = concat!(r#"{"type":"error","id":"req-1","error":"rate limited"}"#, "\n");
        let mut conn = BridgeConnection::new(Vec::new(), Cursor::new(replies.as_bytes()));

        let err = conn.send_task(task()).unwrap_err();
        assert!(err.to_string().contains("rate limited"));

        let err = conn.send_task(task()).unwrap_err();
        assert!(err.to_string().contains("closed stdout"));
    }

    #[test]
    fn ready_expected_first() {
        let replies = concat!(r#"{"type":"error","id":"x","error":"boom"}"#, "\n");
        let mut conn = BridgeConnection::new(Vec::new(), Cursor::new(replies.as_bytes()));
        assert!(conn.wait_for_ready().is_err());
    }

    #[tokio::test]
    async fn missing_runtime_is_bridge_error() {
        let model = BridgeVisionModel::new(BridgeConfig {
            cmd: "tdpflow-no-such-runtime".into(),
            ..BridgeConfig::default()
        });
        let err = model.describe("image/png", b"png", None).await.unwrap_err();
        assert!(matches!(err, TdpFlowError::Bridge(_)));
    }
}
