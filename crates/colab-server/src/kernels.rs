//! Kernel process management.
//!
//! Each kernel is a child process started from the configured kernel command, with
//! `{connection_file}` replaced by a per-kernel path under the connection directory.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colab_core::{SessionError, SessionManager};
use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// How long a fresh kernel must survive before it counts as started.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// Public view of a running kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelInfo {
    pub id: String,
    pub connection_file: PathBuf,
    pub started_at: DateTime<Utc>,
}

struct KernelProcess {
    info: KernelInfo,
    process: Child,
}

impl KernelProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }
}

/// Thread-safe registry of kernel processes.
#[derive(Clone)]
pub struct KernelManager {
    kernels: Arc<Mutex<HashMap<String, KernelProcess>>>,
    command: Arc<Vec<String>>,
    connection_dir: Arc<PathBuf>,
}

impl KernelManager {
    pub fn new(command: Vec<String>, connection_dir: PathBuf) -> Self {
        Self {
            kernels: Arc::default(),
            command: Arc::new(command),
            connection_dir: Arc::new(connection_dir),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, KernelProcess>> {
        self.kernels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_dir(&self) -> &Path {
        &self.connection_dir
    }

    /// Start a kernel, optionally in `cwd`.
    pub async fn start(&self, cwd: Option<&Path>) -> Result<KernelInfo, SessionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SessionError::Start("kernel command is empty".to_string()))?;

        std::fs::create_dir_all(self.connection_dir.as_path()).map_err(|e| {
            SessionError::Start(format!(
                "cannot create connection directory {}: {}",
                self.connection_dir.display(),
                e
            ))
        })?;

        let id = Uuid::new_v4().to_string();
        let connection_file = self.connection_dir.join(format!("kernel-{}.json", id));
        let connection_arg = connection_file.to_string_lossy();

        let mut command = Command::new(program);
        command
            .args(args.iter().map(|a| a.replace(CONNECTION_FILE_PLACEHOLDER, &connection_arg)))
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut process = command
            .spawn()
            .map_err(|e| SessionError::Start(format!("failed to spawn {}: {}", program, e)))?;

        tokio::time::sleep(STARTUP_GRACE).await;
        if let Ok(Some(status)) = process.try_wait() {
            remove_connection_file(&connection_file);
            return Err(SessionError::Start(format!(
                "kernel exited immediately with status {}",
                status
            )));
        }

        let info = KernelInfo {
            id: id.clone(),
            connection_file,
            started_at: Utc::now(),
        };
        info!("Kernel started: {}", id);
        self.lock().insert(
            id,
            KernelProcess {
                info: info.clone(),
                process,
            },
        );
        Ok(info)
    }

    /// Running kernels. Kernels whose process has exited are forgotten.
    pub fn list(&self) -> Vec<KernelInfo> {
        let mut kernels = self.lock();
        prune_exited(&mut kernels);
        let mut infos: Vec<KernelInfo> = kernels.values().map(|k| k.info.clone()).collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        infos
    }

    pub fn get(&self, id: &str) -> Option<KernelInfo> {
        let mut kernels = self.lock();
        prune_exited(&mut kernels);
        kernels.get(id).map(|k| k.info.clone())
    }

    /// Kill one kernel and remove its connection file.
    pub async fn shutdown(&self, id: &str) -> Result<(), SessionError> {
        let kernel = self
            .lock()
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        info!("Shutting down kernel {}", id);
        stop(kernel).await.map_err(|e| SessionError::Shutdown {
            failed: 1,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SessionManager for KernelManager {
    async fn shutdown_all(&self) -> Result<(), SessionError> {
        let kernels: Vec<KernelProcess> = {
            let mut kernels = self.lock();
            kernels.drain().map(|(_, k)| k).collect()
        };

        let mut failures = Vec::new();
        for kernel in kernels {
            let id = kernel.info.id.clone();
            if let Err(e) = stop(kernel).await {
                failures.push(format!("{}: {}", id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Shutdown {
                failed: failures.len(),
                message: failures.join("; "),
            })
        }
    }

    fn active_count(&self) -> usize {
        let mut kernels = self.lock();
        prune_exited(&mut kernels);
        kernels.len()
    }
}

fn prune_exited(kernels: &mut HashMap<String, KernelProcess>) {
    kernels.retain(|id, kernel| {
        let running = kernel.is_running();
        if !running {
            debug!("Kernel {} exited", id);
            remove_connection_file(&kernel.info.connection_file);
        }
        running
    });
}

async fn stop(mut kernel: KernelProcess) -> io::Result<()> {
    let result = if kernel.is_running() {
        match kernel.process.kill().await {
            Ok(()) => Ok(()),
            // Exited between the check and the kill.
            Err(_) if !kernel.is_running() => Ok(()),
            Err(e) => Err(e),
        }
    } else {
        Ok(())
    };
    remove_connection_file(&kernel.info.connection_file);
    result
}

fn remove_connection_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn sleeper() -> Vec<String> {
        vec!["sleep".to_string(), "30".to_string()]
    }

    #[test]
    fn test_kernel_manager_new() {
        let tmp = TempDir::new().unwrap();
        let manager = KernelManager::new(vec![], tmp.path().to_path_buf());
        assert!(manager.list().is_empty());
        assert_eq!(manager.active_count(), 0);
        assert!(manager.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_empty_command_fails_to_start() {
        let tmp = TempDir::new().unwrap();
        let manager = KernelManager::new(vec![], tmp.path().to_path_buf());
        assert!(matches!(
            manager.start(None).await,
            Err(SessionError::Start(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_non_existent() {
        let tmp = TempDir::new().unwrap();
        let manager = KernelManager::new(vec![], tmp.path().to_path_buf());
        assert!(matches!(
            manager.shutdown("nope").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(manager.shutdown_all().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connection_file_substitution() {
        let tmp = TempDir::new().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "touch \"$0\"; sleep 30".to_string(),
            "{connection_file}".to_string(),
        ];
        let manager = KernelManager::new(command, tmp.path().join("security"));
        let info = manager.start(None).await.unwrap();

        assert!(info.connection_file.starts_with(tmp.path().join("security")));
        assert!(info.connection_file.exists());
        assert_eq!(manager.active_count(), 1);

        manager.shutdown(&info.id).await.unwrap();
        assert!(!info.connection_file.exists());
        assert_eq!(manager.active_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_all_kills_everything() {
        let tmp = TempDir::new().unwrap();
        let manager = KernelManager::new(sleeper(), tmp.path().to_path_buf());
        let a = manager.start(None).await.unwrap();
        let b = manager.start(Some(tmp.path())).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(manager.list().len(), 2);

        manager.shutdown_all().await.unwrap();
        assert_eq!(manager.active_count(), 0);
        assert!(manager.get(&a.id).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crashing_kernel_is_reported() {
        let tmp = TempDir::new().unwrap();
        let manager = KernelManager::new(vec!["false".to_string()], tmp.path().to_path_buf());
        assert!(matches!(
            manager.start(None).await,
            Err(SessionError::Start(_))
        ));
        assert_eq!(manager.active_count(), 0);
    }
}
