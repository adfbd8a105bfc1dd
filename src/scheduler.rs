use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;

/// Context provided to background tasks during execution.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler managing interval-driven background tasks with a broadcast
/// shutdown signal. Tasks hold only weak handles to the database, so close
/// signals them and moves on; each loop exits at its next tick.
pub struct Scheduler {
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Register a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        self.spawn_timer_loop(task);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a task never
            // runs before open returns.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Signals every task to stop without waiting for it. Tasks observe
    /// the broadcast at their next suspension point and exit.
    pub fn signal(&self) {
        self.shutdown_tx.send(()).ok();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tasks_run_on_interval() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.signal();
    }

    #[tokio::test]
    async fn test_signal_stops_tasks() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(25)).await;
        scheduler.signal();

        // Let the loop observe the broadcast, then confirm it stays idle.
        tokio::time::sleep(Duration::from_millis(15)).await;
        let count_after_signal = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count_after_signal, counter.load(Ordering::SeqCst));
    }
}
