//! In-memory session registry: which kernel serves which notebook.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionModel {
    pub id: String,
    pub path: String,
    pub kernel_id: String,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionModel>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionModel>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, path: &str, kernel_id: &str) -> SessionModel {
        let session = SessionModel {
            id: Uuid::new_v4().to_string(),
            path: path.to_string(),
            kernel_id: kernel_id.to_string(),
        };
        self.lock().insert(session.id.clone(), session.clone());
        session
    }

    pub fn list(&self) -> Vec<SessionModel> {
        let mut sessions: Vec<SessionModel> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.path.cmp(&b.path));
        sessions
    }

    pub fn get(&self, id: &str) -> Option<SessionModel> {
        self.lock().get(id).cloned()
    }

    pub fn find_by_path(&self, path: &str) -> Option<SessionModel> {
        self.lock().values().find(|s| s.path == path).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<SessionModel> {
        self.lock().remove(id)
    }

    /// Drop sessions whose kernel is gone.
    pub fn retain_kernels(&self, alive: impl Fn(&str) -> bool) {
        self.lock().retain(|_, s| alive(&s.kernel_id));
    }
}
