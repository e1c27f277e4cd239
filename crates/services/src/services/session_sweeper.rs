//! Background task that evicts idle sessions and stale OAuth states.
//!
//! Loads already reject idle sessions on their own; the sweeper only keeps
//! abandoned entries from accumulating in memory.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info};

use super::{oauth::OAuthClient, session::SessionStore};

#[derive(Debug, Clone)]
pub struct SessionSweeperConfig {
    /// How often to sweep (default: 30 seconds)
    pub sweep_interval: Duration,
}

impl Default for SessionSweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

pub fn spawn_session_sweeper(
    sessions: SessionStore,
    oauth: Option<Arc<OAuthClient>>,
    config: Option<SessionSweeperConfig>,
) -> JoinHandle<()> {
    let config = config.unwrap_or_default();

    tokio::spawn(async move {
        let mut interval = time::interval(config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let now = Utc::now();

            let sessions_removed = sessions.purge_expired(now);
            let states_removed = oauth.as_ref().map_or(0, |o| o.purge_expired(now));

            if sessions_removed > 0 || states_removed > 0 {
                info!(
                    sessions_removed,
                    states_removed,
                    live_sessions = sessions.len(),
                    "Swept idle sessions"
                );
            } else {
                debug!("No idle sessions to sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionSweeperConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_sessions() {
        let sessions = SessionStore::new(Duration::from_secs(60));
        sessions.create(Utc::now() - chrono::Duration::seconds(120));
        assert_eq!(sessions.len(), 1);

        let handle = spawn_session_sweeper(
            sessions.clone(),
            None,
            Some(SessionSweeperConfig {
                sweep_interval: Duration::from_secs(5),
            }),
        );

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sessions.is_empty());
        handle.abort();
    }
}
