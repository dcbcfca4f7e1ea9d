use std::sync::Mutex;
use tracing::debug;

/// Ledger of in-flight work used to bound process lifetime at shutdown.
///
/// `wait_for_pending` waits only for tasks registered before the call, so
/// a steady stream of new work cannot keep a caller blocked forever.
pub struct PendingTasks {
    tasks: Mutex<Vec<(String, crossbeam_channel::Receiver<()>)>>,
}

/// Held for the duration of one task; dropping it marks the task done.
pub struct TaskGuard {
    _tx: crossbeam_channel::Sender<()>,
}

impl PendingTasks {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self, label: &str) -> TaskGuard {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|(_, rx)| {
            !matches!(
                rx.try_recv(),
                Err(crossbeam_channel::TryRecvError::Disconnected)
            )
        });
        tasks.push((label.to_string(), rx));
        TaskGuard { _tx: tx }
    }

    /// Block until every task registered so far has finished. Tasks
    /// registered afterwards are not waited on.
    pub fn wait_for_pending(&self) {
        let snapshot: Vec<(String, crossbeam_channel::Receiver<()>)> =
            self.tasks.lock().unwrap().clone();
        for (label, rx) in snapshot {
            if rx.recv().is_err() {
                debug!(task = %label, "Pending task finished");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|(_, rx)| {
            !matches!(
                rx.try_recv(),
                Err(crossbeam_channel::TryRecvError::Disconnected)
            )
        });
        tasks.len()
    }
}

impl Default for PendingTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_once_guards_drop() {
        let tasks = Arc::new(PendingTasks::new());
        let guard = tasks.start("send");
        assert_eq!(tasks.pending_count(), 1);

        let tasks_clone = tasks.clone();
        let waiter = thread::spawn(move || tasks_clone.wait_for_pending());

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.join().unwrap();
        assert_eq!(tasks.pending_count(), 0);
    }

    #[test]
    fn wait_ignores_tasks_started_later() {
        let tasks = Arc::new(PendingTasks::new());
        let first = tasks.start("first");

        let tasks_clone = tasks.clone();
        let waiter = thread::spawn(move || tasks_clone.wait_for_pending());

        thread::sleep(Duration::from_millis(10));
        let _second = tasks.start("second");
        drop(first);

        // Completes even though `second` is still running.
        waiter.join().unwrap();
    }
}
