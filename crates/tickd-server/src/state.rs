use std::sync::Arc;
use tickd_core::config::Config;
use tickd_core::control::ControlSurface;
use tickd_core::queue::ActionQueue;
use tickd_core::store::Store;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: ActionQueue,
    pub control: ControlSurface,
}

impl AppState {
    /// Both halves share `store`; redb allows a single open per process.
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            queue: ActionQueue::from_config(Arc::clone(&store), config),
            control: ControlSurface::new(store, config.status_recent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickd_core::action::{ActionStatus, ActionType};
    use tickd_core::store::RedbStore;

    #[test]
    fn queue_and_control_see_the_same_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(RedbStore::open(&dir.path().join("state.redb")).unwrap());
        let config = Config {
            max_attempts: 7,
            ..Config::default()
        };
        let state = AppState::new(store, &config);

        let action = state
            .queue
            .enqueue(ActionType::Webhook, serde_json::json!({}), "k")
            .unwrap();
        assert_eq!(action.max_attempts, 7);
        let status = state.control.get_status().unwrap();
        assert_eq!(status.queue_depth[&ActionStatus::Pending], 1);
    }
}
