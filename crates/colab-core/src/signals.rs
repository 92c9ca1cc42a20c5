//! Signal coordination.
//!
//! Every signal delivery and every dialog callback becomes a `ControlMessage` on one
//! queue, consumed by a single `SignalCoordinator` task. That task alone owns the
//! `SignalState`, so transitions are serialized no matter how fast signals arrive.
//!
//! ```text
//!   Normal --interrupt--> ArmedForceStop (dialog running)
//!   ArmedForceStop --interrupt--> shutdown
//!   ArmedForceStop --dialog declined / timed out--> Normal
//!   any --terminate--> shutdown
//! ```

use std::io::IsTerminal;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::confirm::{ConfirmDialog, DialogOutcome, CONFIRM_TIMEOUT};
use crate::shutdown::{ShutdownHandle, ShutdownReason};
use crate::status::ServerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalState {
    /// The next interrupt asks for confirmation.
    #[default]
    Normal,
    /// A confirmation is pending; the next interrupt stops the server.
    ArmedForceStop,
}

/// What an interrupt does in the `Normal` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Ask the operator before stopping.
    Confirm,
    /// Stop right away. Used where no interactive terminal is available.
    Immediate,
}

impl InterruptPolicy {
    /// Confirmation needs Unix interrupt semantics and a terminal on stdin.
    pub fn for_platform() -> Self {
        if cfg!(unix) && std::io::stdin().is_terminal() {
            InterruptPolicy::Confirm
        } else {
            InterruptPolicy::Immediate
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Interrupt,
    Terminate,
    Status,
    /// Posted by a dialog that was declined or timed out.
    RestoreInterruptHandler { dialog: u64 },
}

/// The dialog currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub id: u64,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

pub struct SignalCoordinator {
    state: SignalState,
    pending: Option<PendingConfirmation>,
    next_dialog: u64,
    policy: InterruptPolicy,
    rx: mpsc::UnboundedReceiver<ControlMessage>,
    tx: mpsc::UnboundedSender<ControlMessage>,
    state_tx: watch::Sender<SignalState>,
    shutdown: ShutdownHandle,
    status: ServerStatus,
    dialog: Arc<dyn ConfirmDialog>,
}

impl SignalCoordinator {
    pub fn new(
        tx: mpsc::UnboundedSender<ControlMessage>,
        rx: mpsc::UnboundedReceiver<ControlMessage>,
        policy: InterruptPolicy,
        shutdown: ShutdownHandle,
        status: ServerStatus,
        dialog: Arc<dyn ConfirmDialog>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SignalState::Normal);
        Self {
            state: SignalState::Normal,
            pending: None,
            next_dialog: 0,
            policy,
            rx,
            tx,
            state_tx,
            shutdown,
            status,
            dialog,
        }
    }

    /// Publish transitions on an existing channel.
    pub fn with_state(mut self, state_tx: watch::Sender<SignalState>) -> Self {
        state_tx.send_replace(self.state);
        self.state_tx = state_tx;
        self
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SignalState> {
        self.state_tx.subscribe()
    }

    /// Process control messages until shutdown is triggered or every sender is gone.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        debug!("signal coordinator stopped");
    }

    fn handle(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Interrupt => match (self.policy, self.state) {
                (InterruptPolicy::Immediate, _) | (_, SignalState::ArmedForceStop) => {
                    self.stop(ShutdownReason::Interrupt);
                }
                (InterruptPolicy::Confirm, SignalState::Normal) => {
                    self.set_state(SignalState::ArmedForceStop);
                    self.spawn_dialog();
                }
            },
            ControlMessage::Terminate => self.stop(ShutdownReason::Terminate),
            ControlMessage::Status => println!("{}", self.status.text()),
            ControlMessage::RestoreInterruptHandler { dialog } => {
                let current = self.pending.as_ref().map(|p| p.id);
                if current == Some(dialog) && !self.shutdown.is_triggered() {
                    self.pending = None;
                    self.set_state(SignalState::Normal);
                }
            }
        }
    }

    fn stop(&mut self, reason: ShutdownReason) {
        error!("received {} signal, stopping", reason);
        self.shutdown.trigger(reason);
    }

    fn set_state(&mut self, state: SignalState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn spawn_dialog(&mut self) {
        self.next_dialog += 1;
        let id = self.next_dialog;
        let started_at = Utc::now();
        let deadline = started_at
            + chrono::Duration::from_std(CONFIRM_TIMEOUT).unwrap_or(chrono::Duration::zero());
        self.pending = Some(PendingConfirmation {
            id,
            started_at,
            deadline,
        });

        let dialog = Arc::clone(&self.dialog);
        let shutdown = self.shutdown.clone();
        let tx = self.tx.clone();
        let status = self.status.text();
        tokio::spawn(async move {
            match dialog.ask(&status).await {
                DialogOutcome::Confirmed => {
                    shutdown.trigger(ShutdownReason::Confirmed);
                }
                DialogOutcome::Declined | DialogOutcome::TimedOut => {
                    let _ = tx.send(ControlMessage::RestoreInterruptHandler { dialog: id });
                }
            }
        });
    }
}

/// Forward OS signals into the control queue.
///
/// Signals that cannot be registered on this platform are skipped.
#[cfg(unix)]
pub fn forward_os_signals(tx: mpsc::UnboundedSender<ControlMessage>) {
    use tokio::signal::unix::SignalKind;

    forward(SignalKind::interrupt(), ControlMessage::Interrupt, tx.clone());
    forward(SignalKind::terminate(), ControlMessage::Terminate, tx.clone());
    forward(SignalKind::user_defined1(), ControlMessage::Status, tx.clone());
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    forward(SignalKind::info(), ControlMessage::Status, tx.clone());
    drop(tx);
}

#[cfg(unix)]
fn forward(
    kind: tokio::signal::unix::SignalKind,
    msg: ControlMessage,
    tx: mpsc::UnboundedSender<ControlMessage>,
) {
    let mut stream = match tokio::signal::unix::signal(kind) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("signal {:?} unavailable: {}", kind, e);
            return;
        }
    };
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            if tx.send(msg.clone()).is_err() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
pub fn forward_os_signals(tx: mpsc::UnboundedSender<ControlMessage>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(ControlMessage::Interrupt).is_err() {
                break;
            }
        }
    });
}

/// Logged once at startup so the interrupt behavior is never a surprise.
pub fn describe_policy(policy: InterruptPolicy) {
    match policy {
        InterruptPolicy::Confirm => info!(
            "Use Control-C to stop this server and shut down all kernels (twice to skip confirmation)."
        ),
        InterruptPolicy::Immediate => info!(
            "Use Control-C to stop this server and shut down all kernels (no interactive terminal: shutdown is not confirmed)."
        ),
    }
}
