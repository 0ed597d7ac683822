//! Named periodic and one-shot jobs on the tokio timer. Execution is
//! non-reentrant per job id; a tick that lands while the previous run is
//! still active is coalesced. One-shot jobs replace an existing one-shot
//! with the same id, and share the id's lock with the periodic job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Default)]
struct Registry {
    periodic: HashMap<String, JoinHandle<()>>,
    oneshot: HashMap<String, JoinHandle<()>>,
    locks: HashMap<String, Arc<AsyncMutex<()>>>,
}

#[derive(Clone, Default)]
pub struct JobScheduler {
    inner: Arc<Mutex<Registry>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut inner = self.inner.lock().unwrap();
        inner.locks.entry(id.to_string()).or_default().clone()
    }

    /// Register a periodic job. The first run happens one period after
    /// registration. Re-registering an id replaces the previous job.
    pub fn every<F, Fut>(&self, id: &str, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lock = self.lock_for(id);
        let job_id = id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match lock.try_lock() {
                    Ok(_guard) => {
                        debug!(job = %job_id, "job tick");
                        task().await;
                    }
                    Err(_) => {
                        debug!(job = %job_id, "previous run still active, coalescing tick");
                    }
                }
            }
        });
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.periodic.insert(id.to_string(), handle) {
            old.abort();
        }
    }

    /// Schedule a one-shot run after `delay`, replacing any pending one-shot
    /// with the same id. The run waits for the id's lock, so it never
    /// overlaps the periodic job sharing that id.
    pub fn once<Fut>(&self, id: &str, delay: Duration, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lock = self.lock_for(id);
        let job_id = id.to_string();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _guard = lock.lock().await;
            info!(job = %job_id, "one-shot job firing");
            task.await;
        });
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.oneshot.insert(id.to_string(), handle) {
            debug!(job = %id, "replacing pending one-shot");
            old.abort();
        }
    }

    pub fn cancel(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.periodic.remove(id) {
            handle.abort();
        }
        if let Some(handle) = inner.oneshot.remove(id) {
            handle.abort();
        }
    }

    pub fn job_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner.periodic.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, handle) in inner.periodic.drain() {
            handle.abort();
        }
        for (_, handle) in inner.oneshot.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn long_runs_coalesce_ticks() {
        let scheduler = JobScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        scheduler.every("slow", Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(250)).await;
            }
        });

        sleep(Duration::from_millis(1000)).await;
        let runs = count.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected at least two runs, got {runs}");
        assert!(runs <= 4, "ticks were not coalesced, got {runs}");
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn oneshot_replaces_pending_job_with_same_id() {
        let scheduler = JobScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = Arc::clone(&first);
            scheduler.once("pipeline", Duration::from_millis(100), async move {
                first.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let second = Arc::clone(&second);
            scheduler.once("pipeline", Duration::from_millis(200), async move {
                second.fetch_add(1, Ordering::SeqCst);
            });
        }

        sleep(Duration::from_millis(500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn oneshot_waits_for_the_periodic_job_sharing_its_id() {
        let scheduler = JobScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            scheduler.every("pipeline", Duration::from_millis(100), move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push("periodic-start");
                    sleep(Duration::from_millis(200)).await;
                    order.lock().unwrap().push("periodic-end");
                }
            });
        }
        {
            let order = Arc::clone(&order);
            scheduler.once("pipeline", Duration::from_millis(150), async move {
                order.lock().unwrap().push("oneshot");
            });
        }

        sleep(Duration::from_millis(600)).await;
        let order = order.lock().unwrap().clone();
        let oneshot_at = order.iter().position(|s| *s == "oneshot").unwrap();
        let periodic_end = order.iter().position(|s| *s == "periodic-end").unwrap();
        assert!(
            oneshot_at > periodic_end,
            "one-shot ran while periodic job held the lock: {order:?}"
        );
        scheduler.shutdown();
    }
}
