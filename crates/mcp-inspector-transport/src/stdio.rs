use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch::Sender;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{TransportError, TransportResult};
use crate::event::TransportEvent;
use crate::transport::{RequestId, Transport, TransportOptions};
use async_trait::async_trait;

const CHANNEL_CAPACITY: usize = 64;

/// Environment variables inherited by the child when the caller does not
/// override them. Everything else is stripped so a debugging session does
/// not leak the operator's environment into arbitrary servers.
#[cfg(unix)]
const DEFAULT_INHERITED_ENV_VARS: &[&str] =
    &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];
#[cfg(windows)]
const DEFAULT_INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// Transport that launches an MCP server as a child process and relays
/// newline-delimited JSON over its stdin/stdout pipes.
///
/// The child's stderr is not an error channel: each line becomes a
/// [`TransportEvent::Stderr`] so the inspector client can display it.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    stdin_tx: tokio::sync::RwLock<Option<mpsc::Sender<String>>>,
    shutdown_tx: tokio::sync::RwLock<Option<Sender<bool>>>,
    is_shut_down: Mutex<bool>,
}

impl StdioTransport {
    /// Creates a new `StdioTransport` ready to launch the given command on
    /// `start`.
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
        _options: TransportOptions,
    ) -> TransportResult<Self> {
        if command.trim().is_empty() {
            return Err(TransportError::Configuration {
                message: "stdio transport requires a non-empty command".into(),
            });
        }
        Ok(Self {
            command,
            args,
            env,
            cwd,
            stdin_tx: tokio::sync::RwLock::new(None),
            shutdown_tx: tokio::sync::RwLock::new(None),
            is_shut_down: Mutex::new(false),
        })
    }

    /// Child environment: a minimal inherited allowlist overlaid with the
    /// caller-supplied variables.
    fn child_env(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = DEFAULT_INHERITED_ENV_VARS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

#[async_trait]
impl Transport for StdioTransport {
    /// Spawns the child process and wires its three pipes into the event
    /// stream.
    ///
    /// A spawn failure (missing executable, permission error) is returned
    /// here; a child that exits after a successful spawn is reported through
    /// a terminal `Error` + `Closed` event pair.
    async fn start(&self) -> TransportResult<ReceiverStream<TransportEvent>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut lock = self.shutdown_tx.write().await;
            *lock = Some(shutdown_tx);
        }

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .env_clear()
            .envs(self.child_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        #[cfg(windows)]
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW

        #[cfg(unix)]
        command.process_group(0);

        let mut process = command.spawn().map_err(|err| {
            TransportError::ProcessError(format!(
                "failed to spawn '{}': {err}",
                self.command
            ))
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| TransportError::ProcessError("unable to retrieve stdin".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| TransportError::ProcessError("unable to retrieve stdout".into()))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| TransportError::ProcessError("unable to retrieve stderr".into()))?;

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        {
            let mut lock = self.stdin_tx.write().await;
            *lock = Some(stdin_tx);
        }

        // Writer task: stdin_rx -> child stdin, newline framed.
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                tokio::select! {
                    _ = writer_shutdown.changed() => break,
                    message = stdin_rx.recv() => {
                        let Some(message) = message else { break };
                        let line = format!("{message}\n");
                        if stdin.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                        if stdin.flush().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader task: child stdout lines -> Message events.
        let stdout_tx = event_tx.clone();
        let mut stdout_shutdown = shutdown_rx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = stdout_shutdown.changed() => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let frame: serde_json::Value = match serde_json::from_str(&line) {
                                    Ok(frame) => frame,
                                    Err(_) => {
                                        tracing::warn!("skipping malformed stdout line: {line}");
                                        continue;
                                    }
                                };
                                if stdout_tx.send(TransportEvent::Message(frame)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break, // EOF
                            Err(err) => {
                                tracing::warn!("error reading child stdout: {err}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Reader task: child stderr lines -> Stderr events.
        let stderr_tx = event_tx.clone();
        let mut stderr_shutdown = shutdown_rx.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    _ = stderr_shutdown.changed() => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                tracing::debug!(target: "upstream::stderr", "{line}");
                                let event = TransportEvent::Stderr {
                                    timestamp: Utc::now(),
                                    line,
                                };
                                if stderr_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        // Wait task: observes child exit, drains the pipe readers, then
        // emits the terminal event pair.
        let command_name = self.command.clone();
        let mut wait_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = process.wait() => status,
                _ = wait_shutdown.changed() => {
                    let _ = process.start_kill();
                    process.wait().await
                }
            };

            // Let the readers deliver whatever the child flushed before dying.
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let deliberate = *wait_shutdown.borrow();
            match status {
                Ok(status) if !deliberate && !status.success() => {
                    let message = match status.code() {
                        Some(code) => format!("process '{command_name}' exited with code {code}"),
                        None => format!("process '{command_name}' exited by signal"),
                    };
                    let _ = event_tx
                        .send(TransportEvent::Error {
                            message,
                            code: None,
                        })
                        .await;
                }
                Ok(_) => {}
                Err(err) => {
                    let _ = event_tx
                        .send(TransportEvent::Error {
                            message: format!("failed waiting for '{command_name}': {err}"),
                            code: None,
                        })
                        .await;
                }
            }
            let _ = event_tx.send(TransportEvent::Closed).await;
        });

        Ok(ReceiverStream::new(event_rx))
    }

    async fn send(
        &self,
        message: &serde_json::Value,
        _related_request_id: Option<&RequestId>,
    ) -> TransportResult<()> {
        if self.is_shut_down().await {
            return Err(TransportError::SendFailure("transport is shut down".into()));
        }
        let lock = self.stdin_tx.read().await;
        let tx = lock
            .as_ref()
            .ok_or_else(|| TransportError::SendFailure("transport not started".into()))?;
        let payload = serde_json::to_string(message)
            .map_err(|err| TransportError::SendFailure(err.to_string()))?;
        tx.send(payload)
            .await
            .map_err(|_| TransportError::SendFailure("child stdin closed".into()))
    }

    /// Signals shutdown and kills the child. Idempotent.
    async fn shut_down(&self) -> TransportResult<()> {
        {
            let mut lock = self.is_shut_down.lock().await;
            if *lock {
                return Ok(());
            }
            *lock = true;
        }
        // Drop the stdin sender so the child sees EOF even if it ignores
        // signals.
        {
            let mut lock = self.stdin_tx.write().await;
            *lock = None;
        }
        let lock = self.shutdown_tx.write().await;
        if let Some(tx) = lock.as_ref() {
            let _ = tx.send(true);
        }
        Ok(())
    }

    async fn is_shut_down(&self) -> bool {
        *self.is_shut_down.lock().await
    }
}
