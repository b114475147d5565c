//! Application state shared across handlers.

use std::sync::Arc;

use irkfinder_core::{BringUpStatus, Session};
use tokio::sync::watch;

/// State handed to every handler.
pub type SharedState = AppState;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    session: Arc<Session>,
    bring_up: watch::Receiver<BringUpStatus>,
}

impl AppState {
    /// Create application state over the peripheral's session and its
    /// bring-up status feed.
    pub fn new(session: Arc<Session>, bring_up: watch::Receiver<BringUpStatus>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { session, bring_up }),
        }
    }

    /// The captured-key session.
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Latest advertising and GATT bring-up status.
    pub fn bring_up(&self) -> BringUpStatus {
        *self.inner.bring_up.borrow()
    }
}
