//! Process-wide accessor for the live manager's metrics.
//!
//! Installed by the application context outside production so a developer
//! can inspect the realtime layer from anywhere in the process.

use crate::manager::RealtimeManager;
use crate::metrics::RealtimeMetrics;
use std::sync::{Arc, RwLock, Weak};

static MANAGER: RwLock<Option<Weak<RealtimeManager>>> = RwLock::new(None);

pub fn install(manager: &Arc<RealtimeManager>) {
    let mut slot = MANAGER.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(Arc::downgrade(manager));
}

pub fn uninstall() {
    let mut slot = MANAGER.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = None;
}

pub fn is_installed() -> bool {
    manager().is_some()
}

fn manager() -> Option<Arc<RealtimeManager>> {
    MANAGER
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .as_ref()
        .and_then(Weak::upgrade)
}

/// Metrics of the installed manager, if it is still alive.
pub fn metrics() -> Option<RealtimeMetrics> {
    manager().map(|manager| manager.get_metrics())
}

/// [`metrics`] as JSON, for logging or a debug endpoint.
pub fn metrics_json() -> Option<serde_json::Value> {
    metrics().and_then(|metrics| serde_json::to_value(metrics).ok())
}
