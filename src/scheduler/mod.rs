use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Whether to run one final time when the scheduler shuts down
    fn run_on_shutdown(&self) -> bool {
        false
    }

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        run_once(task.as_ref(), run_id, &shutdown_rx).await;
                    }

                    _ = shutdown_rx.recv() => {
                        if task.run_on_shutdown() {
                            run_id += 1;
                            run_once(task.as_ref(), run_id, &shutdown_rx).await;
                        }
                        tracing::info!(task = task.name(), runs = run_id, "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        let tasks = match self.tasks.into_inner() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks {
            task.await
                .map_err(|e| crate::Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

async fn run_once<T: BackgroundTask + ?Sized>(
    task: &T,
    run_id: u64,
    shutdown_rx: &broadcast::Receiver<()>,
) {
    let ctx = Context {
        task_name: task.name(),
        run_id,
        shutdown: shutdown_rx.resubscribe(),
    };

    if let Err(e) = task.execute(ctx).await {
        tracing::error!(
            task = task.name(),
            run_id = run_id,
            error = %e,
            "Task execution failed"
        );
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
