//! Online/offline tracking.
//!
//! State changes arrive from the platform signal and from the sync engine
//! itself (a failed call downgrades to offline right away). Listeners see
//! every transition and nothing else; flapping is passed through as is.
//! The engine follows the `watch` channel rather than a listener, so one
//! online transition yields one drain pass no matter how many listeners exist.

use tokio::sync::watch;
use tracing::info;

use crate::listeners::{Listeners, SubscriptionId};

#[derive(Debug)]
pub struct ConnectionMonitor {
    state: watch::Sender<bool>,
    listeners: Listeners<bool>,
}

impl ConnectionMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state,
            listeners: Listeners::default(),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Live connectivity signal from the host platform.
    pub fn set_platform_state(&self, online: bool) {
        self.transition(online, "platform");
    }

    /// A remote call could not reach the server.
    pub fn report_unreachable(&self) {
        self.transition(false, "remote call failed");
    }

    /// A remote call went through.
    pub fn report_reachable(&self) {
        self.transition(true, "remote call succeeded");
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn transition(&self, online: bool, source: &'static str) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, source, "connectivity changed");
            self.listeners.notify(&online);
        }
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
