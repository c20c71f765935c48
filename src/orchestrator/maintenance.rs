use serde::Serialize;
use std::sync::Arc;

use super::Orchestrator;
use crate::killswitch::MetricsSource;
use crate::supervisor::spawn_periodic;
use crate::types::RequestId;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub reaped: Vec<RequestId>,
    pub pruned_agents: usize,
}

impl Orchestrator {
    /// Kills executions that outlived their timeout by more than the grace
    /// period, then drops idle monitoring windows.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let grace = self.settings.stuck_grace();
        let stuck: Vec<RequestId> = self
            .active
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.started.elapsed() > entry.timeout + grace)
            .map(|(id, _)| *id)
            .collect();

        let mut reaped = Vec::new();
        for id in stuck {
            log::warn!("Reaping stuck execution {}", id);
            if self
                .cancel_execution(id, "Execution stuck past its timeout")
                .await
            {
                reaped.push(id);
            }
        }

        MaintenanceReport {
            reaped,
            pruned_agents: self.monitoring.prune_inactive().await,
        }
    }

    /// Starts the maintenance loop and the kill-switch auto-trigger poller.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() || self.background.is_cancelled() {
            return;
        }

        let weak = Arc::downgrade(self);
        tasks.push(spawn_periodic(
            "maintenance",
            self.settings.maintenance_interval(),
            self.background.child_token(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(this) = weak.upgrade() {
                        let report = this.run_maintenance().await;
                        if !report.reaped.is_empty() || report.pruned_agents > 0 {
                            log::info!(
                                "Maintenance reaped {} executions, pruned {} agents",
                                report.reaped.len(),
                                report.pruned_agents
                            );
                        }
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        ));

        let killswitch = Arc::clone(&self.killswitch);
        let monitoring = Arc::clone(&self.monitoring);
        tasks.push(spawn_periodic(
            "killswitch-poller",
            killswitch.settings().poll_interval(),
            self.background.child_token(),
            move || {
                let killswitch = Arc::clone(&killswitch);
                let monitoring = Arc::clone(&monitoring);
                async move {
                    let source: &dyn MetricsSource = monitoring.as_ref();
                    let fired = killswitch.poll(source).await;
                    if fired > 0 {
                        log::info!("Auto-trigger poll fired {} events", fired);
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        ));
    }

    /// Cancels the background loops and waits for them to finish.
    pub async fn stop(&self) {
        self.background.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Background task ended abnormally: {}", e);
            }
        }
    }
}
