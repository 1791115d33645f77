use log::{debug, error};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::dataset::connector::StopToken;
use crate::error::{RuntimeError, is_interrupted};

pub type WorkerFn = Arc<dyn Fn(usize) -> anyhow::Result<()> + Send + Sync>;

struct PendingTask {
    name: String,
    done: Receiver<anyhow::Result<()>>,
}

#[derive(Default)]
struct GroupState {
    pending: Vec<PendingTask>,
    spawned: usize,
    first_error: Option<anyhow::Error>,
    pools: Vec<rayon::ThreadPool>,
}

/// Owner of every task launched for one execution tree.
///
/// The first failing task requests stop for the whole group.
pub struct TaskGroup {
    stop: StopToken,
    state: Arc<Mutex<GroupState>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            stop: StopToken::new(),
            state: Arc::new(Mutex::new(GroupState::default())),
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut GroupState) -> R) -> anyhow::Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RuntimeError::unexpected("Task group mutex poisoned"))?;
        Ok(f(&mut state))
    }

    fn report(state: &Mutex<GroupState>, stop: &StopToken, name: &str, result: &anyhow::Result<()>) {
        if let Err(e) = result {
            if is_interrupted(e) {
                debug!("Task '{}' interrupted", name);
                return;
            }
            error!("Task '{}' failed: {:#}", name, e);
            if let Ok(mut state) = state.lock() {
                if state.first_error.is_none() {
                    state.first_error = Some(anyhow::anyhow!("Task '{}' failed: {:#}", name, e));
                }
            }
            stop.stop();
        }
    }

    /// Spawns one named OS thread running `f`.
    pub fn create_async_task<F>(&self, name: impl Into<String>, f: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.stop.check()?;
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        let state = self.state.clone();
        let stop = self.stop.clone();
        let task_name = name.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let result = f();
                Self::report(&state, &stop, &task_name, &result);
                let _ = tx.send(result);
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn task '{}': {}", name, e))?;
        debug!("Task '{}' launched", name);
        self.with_state(|s| {
            s.pending.push(PendingTask { name, done: rx });
            s.spawned += 1;
        })
    }

    /// Runs `f(0..n)` on a dedicated pool of `n` threads.
    pub fn launch_workers(&self, name: &str, num_workers: usize, f: WorkerFn) -> anyhow::Result<()> {
        self.stop.check()?;
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(move |i| format!("{}-worker-{}", prefix, i))
            .build()?;
        let mut pending = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::channel();
            let f = f.clone();
            let state = self.state.clone();
            let stop = self.stop.clone();
            let task_name = format!("{} worker {}", name, worker_id);
            pending.push(PendingTask { name: task_name.clone(), done: rx });
            pool.spawn(move || {
                let result = f(worker_id);
                Self::report(&state, &stop, &task_name, &result);
                let _ = tx.send(result);
            });
        }
        debug!("Launched {} workers for '{}'", num_workers, name);
        self.with_state(|s| {
            s.spawned += pending.len();
            s.pending.extend(pending);
            s.pools.push(pool);
        })
    }

    pub fn num_tasks(&self) -> usize {
        self.state.lock().map(|s| s.spawned).unwrap_or(0)
    }

    pub fn service_stop(&self) {
        self.stop.stop();
    }

    /// Waits for every task, including ones spawned while waiting.
    /// Returns the first task failure, interruptions are not failures.
    pub fn join_all(&self) -> anyhow::Result<()> {
        loop {
            let batch = self.with_state(|s| std::mem::take(&mut s.pending))?;
            if batch.is_empty() {
                break;
            }
            for task in batch {
                if task.done.recv().is_err() {
                    error!("Task '{}' exited without reporting", task.name);
                }
            }
        }
        match self.with_state(|s| s.first_error.take())? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn workers_receive_every_index() {
        let group = TaskGroup::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        group
            .launch_workers("test", 4, Arc::new(move |i| {
                sink.lock().unwrap().push(i);
                Ok(())
            }))
            .unwrap();
        group.join_all().unwrap();
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(group.num_tasks(), 4);
    }

    #[test]
    fn failure_stops_the_group() {
        let group = TaskGroup::new();
        let stop = group.stop_token();
        let waited = Arc::new(AtomicUsize::new(0));
        let counter = waited.clone();
        group
            .create_async_task("waiter", move || {
                while !stop.is_stopped() {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RuntimeError::Interrupted.into())
            })
            .unwrap();
        group
            .create_async_task("failing", || anyhow::bail!("boom"))
            .unwrap();
        let err = group.join_all().unwrap_err();
        assert!(format!("{:#}", err).contains("boom"));
        assert_eq!(waited.load(Ordering::SeqCst), 1);
        assert!(group.create_async_task("late", || Ok(())).is_err());
    }
}
