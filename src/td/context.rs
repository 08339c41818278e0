use crate::td::config::{Paths, Settings};
use crate::td::daemon::{DaemonController, DaemonLaunch};
use crate::td::store::StateStore;
use std::sync::Arc;

/// Per-process service objects, built once and handed to the manager and the monitor.
#[derive(Debug)]
pub struct Services {
    pub paths: Paths,
    pub settings: Settings,
    pub store: Arc<StateStore>,
    pub daemon: Arc<DaemonController>,
}

impl Services {
    /// Services whose daemon is this executable re-invoked in monitor mode.
    pub fn new(paths: Paths, settings: Settings) -> anyhow::Result<Arc<Self>> {
        let launch = DaemonLaunch::current_exe(&paths.home)?;
        Ok(Self::with_launch(paths, settings, launch))
    }

    pub fn with_launch(paths: Paths, settings: Settings, launch: DaemonLaunch) -> Arc<Self> {
        let store = Arc::new(StateStore::new(&paths.runtime_file));
        let daemon = Arc::new(DaemonController::new(Arc::clone(&store), launch, settings.stop_grace));
        Arc::new(Self {
            paths,
            settings,
            store,
            daemon,
        })
    }
}
