//! Human-readable server status, shared by the startup banner, the status signal and
//! the confirmation dialog.

use std::sync::Arc;

use crate::ports::BoundEndpoint;
use crate::services::{ContentManager, SessionManager};

#[derive(Clone)]
pub struct ServerStatus {
    contents: Arc<dyn ContentManager>,
    sessions: Arc<dyn SessionManager>,
    endpoint: BoundEndpoint,
}

impl ServerStatus {
    pub fn new(
        contents: Arc<dyn ContentManager>,
        sessions: Arc<dyn SessionManager>,
        endpoint: BoundEndpoint,
    ) -> Self {
        Self {
            contents,
            sessions,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &BoundEndpoint {
        &self.endpoint
    }

    pub fn text(&self) -> String {
        format!(
            "{}\n{} active kernels \nThe notebook server is running at: {}",
            self.contents.info_string(),
            self.sessions.active_count(),
            self.endpoint.display_url()
        )
    }
}
