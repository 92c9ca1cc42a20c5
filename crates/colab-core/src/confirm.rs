//! Interactive shutdown confirmation.
//!
//! The dialog never reads the terminal directly. A single reader thread forwards
//! stdin lines into a channel, and the dialog waits on that channel with a timeout,
//! so a prompt that goes unanswered costs nothing once it times out.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{error, info};

pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
pub const PROMPT: &str = "Shutdown this notebook server (y/[n])? ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogOutcome {
    Confirmed,
    Declined,
    TimedOut,
}

#[async_trait]
pub trait ConfirmDialog: Send + Sync {
    /// Show `status`, ask whether to shut down and wait for the answer.
    async fn ask(&self, status: &str) -> DialogOutcome;
}

/// `y`/`yes`/`Y` confirm; anything containing an `n` does not.
pub fn is_affirmative(line: &str) -> bool {
    let line = line.trim_end().to_lowercase();
    line.starts_with('y') && !line.contains('n')
}

/// Prompts on stdout and reads answers from a line channel.
pub struct TerminalDialog {
    lines: Mutex<mpsc::UnboundedReceiver<String>>,
    timeout: Duration,
}

impl TerminalDialog {
    /// Dialog backed by the process's stdin.
    pub fn stdin() -> Arc<Self> {
        Arc::new(Self::from_lines(spawn_stdin_reader(), CONFIRM_TIMEOUT))
    }

    pub fn from_lines(lines: mpsc::UnboundedReceiver<String>, timeout: Duration) -> Self {
        Self {
            lines: Mutex::new(lines),
            timeout,
        }
    }
}

#[async_trait]
impl ConfirmDialog for TerminalDialog {
    async fn ask(&self, status: &str) -> DialogOutcome {
        info!("interrupted");
        let mut lines = self.lines.lock().await;
        // Lines typed before the prompt are not answers to it.
        while lines.try_recv().is_ok() {}

        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "{status}");
        let _ = write!(stdout, "{PROMPT}");
        let _ = stdout.flush();

        let deadline = Instant::now() + self.timeout;
        let outcome = match tokio::time::timeout_at(deadline, lines.recv()).await {
            Ok(Some(line)) if is_affirmative(&line) => DialogOutcome::Confirmed,
            Ok(Some(_)) => DialogOutcome::Declined,
            Ok(None) => {
                // stdin is closed; wait out the window like an unanswered prompt
                tokio::time::sleep_until(deadline).await;
                DialogOutcome::TimedOut
            }
            Err(_) => DialogOutcome::TimedOut,
        };

        match outcome {
            DialogOutcome::Confirmed => error!("Shutdown confirmed"),
            DialogOutcome::TimedOut => {
                let _ = write!(stdout, "No answer for {}s: ", self.timeout.as_secs());
                let _ = writeln!(stdout, "resuming operation...");
            }
            DialogOutcome::Declined => {
                let _ = writeln!(stdout, "resuming operation...");
            }
        }
        let _ = stdout.flush();
        outcome
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("colab-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        error!("Failed to start terminal reader: {}", e);
    }
    rx
}
