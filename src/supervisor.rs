//! Periodic background loops with cancellation and bounded restarts.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Restarts allowed after a panicking tick before the loop gives up.
pub const MAX_RESTARTS: u32 = 5;

/// Delay before each restart, doubling up to a cap. Runs out after
/// `MAX_RESTARTS` restarts.
struct RestartDelay {
    next: Duration,
    max: Duration,
    restarts: u32,
}

impl RestartDelay {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial,
            max,
            restarts: 0,
        }
    }

    fn next_delay(&mut self) -> Option<Duration> {
        if self.restarts >= MAX_RESTARTS {
            return None;
        }
        self.restarts += 1;
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        Some(delay)
    }
}

/// Runs `tick` every `period` until `cancel` fires.
///
/// A tick that returns an error is logged and the loop continues. A tick
/// that panics takes the loop down; it is restarted after an exponential
/// delay, at most `MAX_RESTARTS` times.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let tick = Arc::new(tick);
    tokio::spawn(async move {
        let mut delays = RestartDelay::new(Duration::from_secs(1), Duration::from_secs(60));
        log::info!("Background loop '{}' started ({:?} interval)", name, period);

        loop {
            let run = tokio::spawn(run_loop(name, period, cancel.clone(), Arc::clone(&tick)));
            match run.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    let Some(delay) = delays.next_delay() else {
                        log::error!(
                            "Background loop '{}' panicked {} times, giving up",
                            name,
                            MAX_RESTARTS + 1
                        );
                        break;
                    };
                    log::error!(
                        "Background loop '{}' panicked, restarting in {:?}",
                        name,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(_) => break,
            }
        }

        log::info!("Background loop '{}' stopped", name);
    })
}

async fn run_loop<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, tick: Arc<F>)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = (*tick)().await {
                    log::error!("Background loop '{}' tick failed: {:#}", name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_restart_delay_doubles_then_runs_out() {
        let mut delays = RestartDelay::new(Duration::from_secs(1), Duration::from_secs(5));
        let seen: Vec<_> = std::iter::from_fn(|| delays.next_delay()).collect();
        assert_eq!(
            seen,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
        );
        assert_eq!(seen.len() as u32, MAX_RESTARTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_loop() {
        let ticks = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic("test", Duration::from_secs(5), cancel.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("transient"))
            }
        });

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_loop_is_restarted() {
        let ticks = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic("panicky", Duration::from_secs(1), cancel.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
                Ok::<(), anyhow::Error>(())
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(ticks.load(Ordering::SeqCst) > 2);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }
}
