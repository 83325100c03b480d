//! Pi RPC client.
//!
//! Talks to a `pi --mode rpc` subprocess over JSON lines on stdin/stdout.
//! Responses are correlated by request id, events are broadcast, and
//! extension `notify` requests are routed to a registered handler so they
//! are delivered even when nobody is subscribed to the event feed.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};

use super::runtime::{NotifyHandler, PiProcess};
use super::types::*;

type PendingResponses = Arc<RwLock<HashMap<String, oneshot::Sender<PiResponse>>>>;
type NotifySlot = Arc<RwLock<Option<NotifyHandler>>>;

/// Configuration for the Pi client.
#[derive(Debug, Clone)]
pub struct PiClientConfig {
    /// Buffer size for the event broadcast channel.
    pub event_buffer_size: usize,
    /// Buffer size for the command channel.
    pub command_buffer_size: usize,
    /// How long to wait for a command response.
    pub response_timeout: Duration,
}

impl Default for PiClientConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1024,
            command_buffer_size: 64,
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Client for communicating with a pi subprocess.
pub struct PiClient {
    command_tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<PiEvent>,
    pending_responses: PendingResponses,
    notify_handler: NotifySlot,
    request_counter: AtomicU64,
    response_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl PiClient {
    /// Create a new Pi client from a child process.
    ///
    /// Takes ownership of the child's stdin/stdout for communication.
    pub fn new(mut child: Child, config: PiClientConfig) -> Result<Self> {
        let stdin = child.stdin.take().context("pi process has no stdin")?;
        let stdout = child.stdout.take().context("pi process has no stdout")?;

        let (command_tx, command_rx) = mpsc::channel::<String>(config.command_buffer_size);
        let (event_tx, _) = broadcast::channel::<PiEvent>(config.event_buffer_size);
        let pending_responses: PendingResponses = Arc::new(RwLock::new(HashMap::new()));
        let notify_handler: NotifySlot = Arc::new(RwLock::new(None));

        tokio::spawn(Self::stdin_writer_task(stdin, command_rx));
        tokio::spawn(Self::stdout_reader_task(
            stdout,
            event_tx.clone(),
            Arc::clone(&pending_responses),
            Arc::clone(&notify_handler),
        ));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::stderr_reader_task(stderr));
        }

        Ok(Self {
            command_tx,
            event_tx,
            pending_responses,
            notify_handler,
            request_counter: AtomicU64::new(0),
            response_timeout: config.response_timeout,
            child: Mutex::new(Some(child)),
        })
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}", n)
    }

    async fn stdin_writer_task(mut stdin: ChildStdin, mut command_rx: mpsc::Receiver<String>) {
        debug!("Pi stdin writer task started");
        while let Some(command) = command_rx.recv().await {
            let line = format!("{}\n", command);
            let display_cmd: String = command.chars().take(200).collect();
            debug!("Sending to pi: {}", display_cmd);
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!("Failed to write to pi stdin: {:?}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush pi stdin: {:?}", e);
                break;
            }
        }
        debug!("Pi stdin writer task ended");
    }

    async fn stdout_reader_task(
        stdout: ChildStdout,
        event_tx: broadcast::Sender<PiEvent>,
        pending_responses: PendingResponses,
        notify_handler: NotifySlot,
    ) {
        let mut lines = BufReader::new(stdout).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }

            match PiMessage::parse(&line) {
                Ok(PiMessage::Response(response)) => {
                    let Some(id) = response.id.clone() else {
                        warn!("Response has no ID: {:?}", response);
                        continue;
                    };
                    match pending_responses.write().await.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => warn!("Received response for unknown request ID: {}", id),
                    }
                }
                Ok(PiMessage::Event(PiEvent::ExtensionUiRequest(request)))
                    if request.is_notify() =>
                {
                    let text = request.message.clone().unwrap_or_default();
                    match notify_handler.read().await.as_ref() {
                        Some(handler) => handler(text),
                        None => debug!("Dropping pi notification with no handler: {}", text),
                    }
                    let _ = event_tx.send(PiEvent::ExtensionUiRequest(request));
                }
                Ok(PiMessage::Event(event)) => {
                    // No subscribers is normal between prompts.
                    let _ = event_tx.send(event);
                }
                Err(e) => {
                    let display_line: String = line.chars().take(200).collect();
                    warn!("Failed to parse pi message: {:?}, line: {}", e, display_line);
                }
            }
        }

        // Fail waiting callers fast instead of letting them time out.
        pending_responses.write().await.clear();
        info!("Pi stdout reader task ended");
    }

    async fn stderr_reader_task(stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                warn!("Pi stderr: {}", line);
            }
        }
    }
}

#[async_trait]
impl PiProcess for PiClient {
    async fn send_command(&self, command: PiCommand) -> Result<PiResponse> {
        let request_id = self.next_request_id();
        let name = command.name();
        let json = serde_json::to_string(&command.with_id(request_id.clone()))
            .context("failed to serialize command")?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending_responses
            .write()
            .await
            .insert(request_id.clone(), response_tx);

        if let Err(e) = self.command_tx.send(json).await {
            self.pending_responses.write().await.remove(&request_id);
            bail!("failed to send {} command to pi: {}", name, e);
        }

        let response = match tokio::time::timeout(self.response_timeout, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => bail!("pi exited before answering {}", name),
            Err(_) => {
                self.pending_responses.write().await.remove(&request_id);
                bail!("timeout waiting for pi response to {}", name);
            }
        };

        Ok(response)
    }

    fn subscribe(&self) -> broadcast::Receiver<PiEvent> {
        self.event_tx.subscribe()
    }

    async fn set_notify_handler(&self, handler: NotifyHandler) {
        *self.notify_handler.write().await = Some(handler);
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            child.kill().await.context("killing pi process")?;
        }
        Ok(())
    }
}
