//! Online/offline detection.
//!
//! [`NetworkMonitor`] is an optional source for
//! [`SubscriptionClientBuilder::network_status`](crate::SubscriptionClientBuilder::network_status).
//! It watches interface changes with platform-native APIs and publishes the
//! online state on a `watch` channel.
//!
//! # Example
//!
//! ```ignore
//! use qminder_subscriptions::{NetworkMonitor, SubscriptionClient};
//!
//! let monitor = NetworkMonitor::new();
//! monitor.start()?;
//!
//! let client = SubscriptionClient::builder("API_KEY")
//!     .network_status(monitor.subscribe())
//!     .build()?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::logging::targets;

/// Publishes online/offline transitions of the host.
pub struct NetworkMonitor {
    online: Arc<watch::Sender<bool>>,
    inner: Mutex<MonitorInner>,
}

struct MonitorInner {
    /// Handle to stop the watcher (drop to stop).
    watcher: Option<netwatcher::WatchHandle>,
}

impl NetworkMonitor {
    /// Create a monitor seeded with the current online state.
    pub fn new() -> Self {
        let (online, _) = watch::channel(check_online_state());
        Self {
            online: Arc::new(online),
            inner: Mutex::new(MonitorInner { watcher: None }),
        }
    }

    /// Check if the host currently looks online.
    ///
    /// Online means at least one interface other than loopback is up and has
    /// an address.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Receive the online state and its changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Start watching interface changes.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.watcher.is_some() {
            return Ok(());
        }

        let online = Arc::clone(&self.online);
        let handle = netwatcher::watch_interfaces(move |_update| {
            let now_online = check_online_state();
            let changed = online.send_if_modified(|current| {
                if *current == now_online {
                    return false;
                }
                *current = now_online;
                true
            });
            if changed {
                tracing::debug!(target: targets::NETWORK, online = now_online, "Online state changed");
            }
        })
        .map_err(|e| Error::Connection(format!("Failed to watch network interfaces: {e}")))?;

        inner.watcher = Some(handle);
        Ok(())
    }

    /// Stop watching.
    pub fn stop(&self) {
        self.inner.lock().watcher = None;
    }

    /// Check if the monitor is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.lock().watcher.is_some()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .field("running", &self.is_running())
            .finish()
    }
}

fn check_online_state() -> bool {
    netdev::get_interfaces()
        .iter()
        .any(|iface| {
            iface.is_up()
                && !iface.is_loopback()
                && (!iface.ipv4.is_empty() || !iface.ipv6.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_see_current_state() {
        let monitor = NetworkMonitor::new();
        let online = monitor.subscribe();
        assert_eq!(*online.borrow(), monitor.is_online());
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_stop_without_start() {
        let monitor = NetworkMonitor::default();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
