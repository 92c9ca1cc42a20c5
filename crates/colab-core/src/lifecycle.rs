//! Lifecycle controller: startup ordering, the serving loop and the shutdown path.
//!
//! Startup: bind → write discovery record → open browser → serve.
//! Shutdown: stop serving → shut down kernels → remove discovery record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::confirm::{ConfirmDialog, TerminalDialog};
use crate::discovery::{self, DiscoveryRecord};
use crate::error::{BindError, Result};
use crate::ports::{self, Binder, Bound, BoundEndpoint};
use crate::services::{ContentManager, Service, SessionManager};
use crate::shutdown::{ShutdownHandle, ShutdownReason, Teardown};
use crate::signals::{self, ControlMessage, InterruptPolicy, SignalCoordinator, SignalState};
use crate::status::ServerStatus;

const ALL_INTERFACES_WARNING: &str =
    "WARNING: The notebook server is listening on all IP addresses";

pub struct Lifecycle {
    config: Arc<ServerConfig>,
    sessions: Arc<dyn SessionManager>,
    contents: Arc<dyn ContentManager>,
    dialog: Option<Arc<dyn ConfirmDialog>>,
    policy: InterruptPolicy,
    info_file: PathBuf,
    shutdown: ShutdownHandle,
    teardown: Arc<Teardown>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    state_tx: watch::Sender<SignalState>,
}

impl Lifecycle {
    pub fn new(
        config: Arc<ServerConfig>,
        sessions: Arc<dyn SessionManager>,
        contents: Arc<dyn ContentManager>,
    ) -> Self {
        let info_file = config.info_file();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SignalState::Normal);
        Self {
            teardown: Arc::new(Teardown::new(Arc::clone(&sessions), info_file.clone())),
            config,
            sessions,
            contents,
            dialog: None,
            policy: InterruptPolicy::for_platform(),
            info_file,
            shutdown: ShutdownHandle::new(),
            control_tx,
            control_rx,
            state_tx,
        }
    }

    /// Replace the terminal dialog, e.g. with a scripted one.
    pub fn with_dialog(mut self, dialog: Arc<dyn ConfirmDialog>) -> Self {
        self.dialog = Some(dialog);
        self
    }

    pub fn with_policy(mut self, policy: InterruptPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Where the discovery record goes; fixed for the life of the process.
    pub fn with_info_file(mut self, path: PathBuf) -> Self {
        self.teardown = Arc::new(Teardown::new(Arc::clone(&self.sessions), path.clone()));
        self.info_file = path;
        self
    }

    pub fn info_file(&self) -> &Path {
        &self.info_file
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn teardown(&self) -> Arc<Teardown> {
        Arc::clone(&self.teardown)
    }

    /// Sender for signal deliveries; see [`signals::forward_os_signals`].
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlMessage> {
        self.control_tx.clone()
    }

    /// Observe the interrupt state while serving.
    pub fn signal_state(&self) -> watch::Receiver<SignalState> {
        self.state_tx.subscribe()
    }

    /// Bind the listening socket, warning when exposed on every interface.
    pub fn bind<B: Binder>(
        &self,
        binder: &mut B,
    ) -> std::result::Result<Bound<B::Listener>, BindError> {
        let config = &self.config;
        if config.ip.is_none() {
            if !config.is_secure() {
                error!(
                    "{} and not using encryption. This is not recommended.",
                    ALL_INTERFACES_WARNING
                );
            }
            if config.password_hash.is_none() {
                error!(
                    "{} and not using authentication. This is highly insecure and not recommended.",
                    ALL_INTERFACES_WARNING
                );
            }
        }

        ports::allocate(
            binder,
            config.ip,
            config.port,
            config.port_retries,
            config.is_secure(),
        )
        .inspect_err(|e| match e {
            BindError::NoAvailablePort { .. } => error!(
                "ERROR: the notebook server could not be started because no available port could be found."
            ),
            other => error!("ERROR: the notebook server could not be started: {}", other),
        })
    }

    /// Run the server to completion. Returns once teardown has finished.
    ///
    /// `make_service` receives the bound endpoint and builds the request-serving
    /// component that takes over the socket.
    pub async fn run<B, S, F>(self, binder: &mut B, make_service: F) -> Result<()>
    where
        B: Binder,
        B::Listener: Send + 'static,
        S: Service<B::Listener>,
        F: FnOnce(&BoundEndpoint) -> S,
    {
        let Bound { listener, endpoint } = self.bind(binder)?;

        let status = ServerStatus::new(
            Arc::clone(&self.contents),
            Arc::clone(&self.sessions),
            endpoint,
        );
        for line in status.text().lines() {
            info!("{}", line);
        }
        signals::describe_policy(self.policy);

        let record = DiscoveryRecord::from(&endpoint);
        discovery::write(&record, &self.info_file)?;

        if self.config.open_browser {
            open_browser(endpoint.connection_url(), self.config.browser.clone());
        }

        let dialog: Arc<dyn ConfirmDialog> = match self.dialog {
            Some(dialog) => dialog,
            None if self.policy == InterruptPolicy::Confirm => TerminalDialog::stdin(),
            None => Arc::new(NoDialog),
        };
        let coordinator = SignalCoordinator::new(
            self.control_tx.clone(),
            self.control_rx,
            self.policy,
            self.shutdown.clone(),
            status,
            dialog,
        )
        .with_state(self.state_tx);
        let coordinator = tokio::spawn(coordinator.run());

        let service = make_service(&endpoint);
        let served = service.serve(listener, self.shutdown.clone()).await;

        self.shutdown.trigger(ShutdownReason::ServiceExited);
        match self.shutdown.reason() {
            Some(ShutdownReason::Interrupt) => info!("Interrupted..."),
            Some(ShutdownReason::ServiceExited) => info!("Server stopped"),
            Some(reason) => info!("Server stopped ({})", reason),
            None => {}
        }
        let _ = coordinator.await;

        if let Err(e) = &served {
            error!("Server error: {}", e);
        }
        self.teardown.run().await;
        served
    }
}

/// Stand-in for policies that never ask.
struct NoDialog;

#[async_trait::async_trait]
impl ConfirmDialog for NoDialog {
    async fn ask(&self, _status: &str) -> crate::confirm::DialogOutcome {
        crate::confirm::DialogOutcome::Declined
    }
}

/// Open `url` in a browser without blocking the caller. Failures are warnings.
pub fn open_browser(url: String, browser: Option<String>) {
    tokio::task::spawn_blocking(move || {
        let result = match &browser {
            Some(app) => open::with(&url, app),
            None => open::that(&url),
        };
        if let Err(e) = result {
            warn!("No web browser found: {}.", e);
        }
    });
}
