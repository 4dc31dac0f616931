//! Process transport: bridges a child engine process's text streams to typed
//! send/receive operations.
//!
//! The engine runs as a direct child process. A dedicated writer task owns
//! stdin and a dedicated reader task owns stdout, pushing whole lines into a
//! channel in emission order; stderr is drained to the log so a chatty engine
//! cannot deadlock on a full pipe buffer. No other component touches the raw
//! streams.

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{EngineError, EngineResult};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Bounded wait for the process to exit after `quit` before force-killing.
const QUIT_GRACE: Duration = Duration::from_millis(500);

/// Owns the engine process handle and its two byte streams.
///
/// A crash or unexpected close is observable: [`ProcessTransport::send`]
/// fails with `TransportClosed` and [`ProcessTransport::next_line`] returns
/// `None`, never a silent hang.
#[derive(Debug)]
pub struct ProcessTransport {
    commands: mpsc::UnboundedSender<String>,
    lines: mpsc::UnboundedReceiver<String>,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessTransport {
    /// Launch the engine binary and start the stream pump tasks.
    pub async fn spawn(path: PathBuf) -> EngineResult<Self> {
        info!("Starting engine process: {:?}", path);

        let mut command = Command::new(&path);
        command.current_dir(path.parent().unwrap_or_else(|| Path::new(".")));
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TERM", "dumb");

        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|e| {
            error!("Failed to spawn engine process {:?}: {}", path, e);
            EngineError::Launch(e)
        })?;

        let mut stdin = child.stdin.take().ok_or(EngineError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(EngineError::NoStdout)?;
        let stderr = child.stderr.take();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<String>();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(line) = command_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!("Engine stdin closed while sending {:?}: {}", line.trim_end(), e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!("Engine stdin flush failed: {}", e);
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut stdout_lines = BufReader::new(stdout).lines();
            loop {
                match stdout_lines.next_line().await {
                    Ok(Some(line)) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Engine stdout reached EOF");
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading engine stdout: {}", e);
                        break;
                    }
                }
            }
        });

        let stderr_drain = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[engine-stderr] {}", line);
                }
            }
        });

        Ok(Self {
            commands: command_tx,
            lines: line_rx,
            child: Some(child),
            pumps: vec![writer, reader, stderr_drain],
        })
    }

    /// Write one command line to the engine's input.
    ///
    /// The trailing newline is appended here; callers pass bare commands.
    pub fn send(&self, line: &str) -> EngineResult<()> {
        debug!("[engine-stdin] {}", line);
        self.commands
            .send(format!("{}\n", line))
            .map_err(|_| EngineError::TransportClosed)
    }

    /// Next inbound line, in the order the engine emitted it. `None` once
    /// the process closes its stdout.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Non-blocking receive, used to drain stale output between searches.
    pub fn try_next_line(&mut self) -> Option<String> {
        self.lines.try_recv().ok()
    }

    /// Clonable raw-command sender. Held only by the session's cancel
    /// handle; everything else goes through the session's operations.
    pub(crate) fn command_sink(&self) -> mpsc::UnboundedSender<String> {
        self.commands.clone()
    }

    /// Shut the transport down: ask the engine to quit, force-kill if it
    /// lingers, and stop the pump tasks. No lines are delivered afterwards.
    pub async fn stop(&mut self) {
        let _ = self.send("quit");

        if let Some(mut child) = self.child.take() {
            match timeout(QUIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Engine process exited with status: {:?}", status);
                }
                Ok(Err(e)) => {
                    warn!("Error waiting for engine process: {}", e);
                    let _ = child.kill().await;
                }
                Err(_) => {
                    warn!("Engine did not exit after quit, force-killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }

        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        self.lines.close();
        while self.lines.try_recv().is_ok() {}
    }

    /// Transport backed by in-memory channels instead of a process, used to
    /// drive the session against a scripted engine.
    #[cfg(test)]
    pub(crate) fn scripted() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let transport = Self {
            commands: command_tx,
            lines: line_rx,
            child: None,
            pumps: Vec::new(),
        };
        (transport, command_rx, line_tx)
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        // stop() is the graceful path; this only reaps a leaked process.
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_missing_binary_is_launch_error() {
        let result = ProcessTransport::spawn(PathBuf::from("/nonexistent/engine")).await;
        match result {
            Err(EngineError::Launch(_)) => {}
            other => panic!("expected Launch error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_send_after_peer_gone_is_transport_closed() {
        let (transport, command_rx, _line_tx) = ProcessTransport::scripted();
        drop(command_rx);
        assert!(matches!(
            transport.send("isready"),
            Err(EngineError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_lines_preserve_order_and_end_on_close() {
        let (mut transport, _command_rx, line_tx) = ProcessTransport::scripted();
        line_tx.send("uciok".to_string()).unwrap();
        line_tx.send("readyok".to_string()).unwrap();
        drop(line_tx);

        assert_eq!(transport.next_line().await.as_deref(), Some("uciok"));
        assert_eq!(transport.next_line().await.as_deref(), Some("readyok"));
        assert_eq!(transport.next_line().await, None);
    }
}
