use config::Config;
use log::*;
use realtime::{debug, RealtimeManager, Scheduler};
use realtime::transport::Transport;
use std::sync::Arc;

pub mod config;
pub mod logging;

// Application-level state shared by everything that talks to the realtime layer.
// Cheap to clone; all clones share the same manager.
#[derive(Clone)]
pub struct AppState {
    pub realtime: Arc<RealtimeManager>,
    pub config: Config,
}

impl AppState {
    /// Build the realtime manager from `config` over the given transport and
    /// scheduler. Outside production the manager's metrics are exposed
    /// through `realtime::debug`.
    pub fn init(
        app_config: Config,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let realtime = RealtimeManager::init(app_config.realtime_config(), transport, scheduler);

        if !app_config.is_production() {
            debug::install(&realtime);
            info!(
                "Realtime debug metrics enabled ({} environment)",
                app_config.runtime_env()
            );
        }

        Self {
            realtime,
            config: app_config,
        }
    }

    pub fn realtime_ref(&self) -> &RealtimeManager {
        self.realtime.as_ref()
    }

    /// Tear down every subscription, presence room and typing indicator.
    pub fn shutdown(&self) {
        if !self.config.is_production() {
            debug::uninstall();
        }
        self.realtime.destroy();
        info!("Application state shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use realtime::{LoopbackTransport, ManualClock, SubscriptionConfig};

    fn state(args: &[&str]) -> (AppState, LoopbackTransport) {
        let transport = LoopbackTransport::new();
        let config = Config::parse_from(args.iter().copied());
        let state = AppState::init(
            config,
            Arc::new(transport.clone()),
            Arc::new(ManualClock::new()),
        );
        (state, transport)
    }

    // The debug hook is process-wide, so install/uninstall is checked in one test.
    #[test]
    fn debug_hook_follows_runtime_env() {
        let (production, _) = state(&["foodshare_realtime", "--runtime-env", "production"]);
        assert!(!debug::is_installed());
        production.shutdown();

        let (development, _) = state(&["foodshare_realtime"]);
        development
            .realtime
            .subscribe(SubscriptionConfig::new("posts", |_| Ok(())));
        let metrics = debug::metrics().unwrap();
        assert_eq!(metrics.channel_count, 1);

        development.shutdown();
        assert!(!debug::is_installed());
    }

    #[test]
    fn shutdown_closes_channels() {
        let (state, transport) = state(&["foodshare_realtime", "--runtime-env", "production"]);
        state
            .realtime
            .subscribe(SubscriptionConfig::new("posts", |_| Ok(())));
        assert_eq!(transport.channel_count(), 1);

        state.shutdown();
        assert_eq!(transport.channel_count(), 0);
        assert!(state.realtime_ref().is_destroyed());
    }
}
