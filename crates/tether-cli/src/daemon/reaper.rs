//! Child reaping driven by SIGCHLD.
//!
//! tokio's signal driver already implements the self-pipe trick: its
//! handler only writes a wake-up byte, and the stream below yields in
//! ordinary task context, where touching the registry is safe.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::daemon::session::SessionManager;

/// Sweep interval used even without a SIGCHLD wake-up.
const FALLBACK_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Registered SIGCHLD listener, created during daemon startup so no exit
/// between bind and the first accept goes unnoticed.
pub struct Reaper {
    sigchld: Signal,
}

impl Reaper {
    pub fn install() -> Result<Self> {
        let sigchld = signal(SignalKind::child()).context("Failed to register SIGCHLD handler")?;
        Ok(Self { sigchld })
    }

    /// Run the reaping loop until the task is aborted or the manager is dropped.
    pub fn spawn(self, sessions: &Arc<SessionManager>) -> JoinHandle<()> {
        let weak = Arc::downgrade(sessions);
        let mut sigchld = self.sigchld;

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(FALLBACK_SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    received = sigchld.recv() => {
                        if received.is_none() {
                            debug!("SIGCHLD stream closed, reaper exiting");
                            break;
                        }
                    }
                    _ = sweep.tick() => {}
                }

                let Some(sessions) = weak.upgrade() else {
                    debug!("SessionManager dropped, reaper exiting");
                    break;
                };
                // One notification may stand for several exits; reap sweeps them all.
                let reaped = sessions.reap().await;
                if reaped > 0 {
                    debug!("Reaped {} session(s)", reaped);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::pty::TermSize;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reaper_removes_exited_sessions() {
        let sessions = Arc::new(SessionManager::new());
        let handle = Reaper::install().unwrap().spawn(&sessions);

        let id = sessions
            .spawn(Some("sleep 0.2"), TermSize::default())
            .await
            .unwrap();
        assert!(sessions.find(id).await.is_some());

        let gone = timeout(Duration::from_secs(5), async {
            while sessions.find(id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "session {} was never reaped", id);

        handle.abort();
    }

    #[tokio::test]
    async fn test_reaper_keeps_live_sessions() {
        let sessions = Arc::new(SessionManager::new());
        let handle = Reaper::install().unwrap().spawn(&sessions);

        let id = sessions
            .spawn(Some("sleep 30"), TermSize::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(sessions.find(id).await.is_some());

        handle.abort();
        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn test_reaper_exits_when_manager_dropped() {
        let sessions = Arc::new(SessionManager::new());
        let handle = Reaper::install().unwrap().spawn(&sessions);
        drop(sessions);

        let finished = timeout(Duration::from_secs(3), handle).await;
        assert!(finished.is_ok());
    }
}
