//! Pi runtime abstraction.
//!
//! The coordinator and registry only see [`PiRuntime`] and [`PiProcess`], so
//! tests can substitute a scripted runtime for the real subprocess.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::broadcast;

use super::client::{PiClient, PiClientConfig};
use super::types::*;

/// Callback receiving the text of out-of-band `notify` requests.
///
/// Invoked from the process reader task, so it must not block.
pub type NotifyHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Configuration for spawning a Pi process.
#[derive(Debug, Clone)]
pub struct PiSpawnConfig {
    /// Working directory for the Pi process.
    pub work_dir: PathBuf,
    /// Path to the Pi executable.
    pub pi_executable: String,
    /// Session file to resume (`--session <path>`).
    pub session_file: Option<PathBuf>,
    /// Provider to use (e.g., "anthropic", "openai").
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Extension files to load.
    pub extensions: Vec<String>,
    /// Environment variables to set.
    pub env: HashMap<String, String>,
}

impl Default for PiSpawnConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            pi_executable: "pi".to_string(),
            session_file: None,
            provider: None,
            model: None,
            extensions: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// A running agent process.
#[async_trait]
pub trait PiProcess: Send + Sync {
    /// Send a command to Pi and wait for the response.
    async fn send_command(&self, command: PiCommand) -> Result<PiResponse>;

    /// Subscribe to events from Pi.
    fn subscribe(&self) -> broadcast::Receiver<PiEvent>;

    /// Register the receiver for out-of-band notifications, replacing any
    /// previous one.
    async fn set_notify_handler(&self, handler: NotifyHandler);

    /// Terminate the process.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Send a prompt; fails when pi rejects it.
    async fn prompt(&self, message: &str) -> Result<()> {
        let response = self
            .send_command(PiCommand::Prompt {
                id: None,
                message: message.to_string(),
            })
            .await?;
        if !response.success {
            bail!(
                "prompt rejected: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(())
    }

    /// Abort the current operation.
    async fn abort(&self) -> Result<()> {
        self.send_command(PiCommand::Abort { id: None }).await?;
        Ok(())
    }
}

/// Spawns agent processes.
#[async_trait]
pub trait PiRuntime: Send + Sync {
    async fn spawn(&self, config: PiSpawnConfig) -> Result<Box<dyn PiProcess>>;
}

/// Runtime that spawns Pi as a direct subprocess.
#[derive(Debug, Default)]
pub struct LocalPiRuntime {
    config: PiClientConfig,
}

impl LocalPiRuntime {
    pub fn new(config: PiClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PiRuntime for LocalPiRuntime {
    async fn spawn(&self, config: PiSpawnConfig) -> Result<Box<dyn PiProcess>> {
        info!(
            "Spawning local Pi process in {:?}, session={:?}",
            config.work_dir, config.session_file
        );

        std::fs::create_dir_all(&config.work_dir).with_context(|| {
            format!("creating pi work dir: {}", config.work_dir.display())
        })?;

        let mut cmd = Command::new(&config.pi_executable);
        cmd.arg("--mode").arg("rpc");

        if let Some(ref session_file) = config.session_file {
            cmd.arg("--session").arg(session_file);
        }
        if let Some(ref provider) = config.provider {
            cmd.arg("--provider").arg(provider);
        }
        if let Some(ref model) = config.model {
            cmd.arg("--model").arg(model);
        }
        for extension in &config.extensions {
            cmd.arg("--extension").arg(extension);
        }

        cmd.current_dir(&config.work_dir)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning pi process: {}", config.pi_executable))?;

        let client = PiClient::new(child, self.config.clone())?;
        Ok(Box::new(client))
    }
}
