// src/worker.rs
//
// Fixed pool of long-lived worker threads draining the task queue.
// Each finished step goes back through the completion channel, with a
// byte down the notify pipe to wake the dispatcher.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use crate::error::{HearthError, HearthResult};
use crate::policy::{Completion, DispatchPolicy, Task, WorkerEnv};
use crate::queue::TaskQueue;
use crate::syscalls;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers. Thread creation failure is a startup
    /// error; the caller aborts before serving.
    pub fn spawn(
        count: usize,
        queue: Arc<TaskQueue<Task>>,
        completions: Sender<Completion>,
        notify_wr: RawFd,
        env: WorkerEnv,
        policy: Arc<dyn DispatchPolicy>,
    ) -> HearthResult<Self> {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let env = Arc::new(env);
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let queue = Arc::clone(&queue);
            let completions = completions.clone();
            let env = Arc::clone(&env);
            let policy = Arc::clone(&policy);

            let handle = thread::Builder::new()
                .name(format!("hearth-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        let _ = core_affinity::set_for_current(id);
                    }
                    tracing::debug!(worker = i, "worker online");

                    while let Some(task) = queue.pop() {
                        let completion = policy.run_task(task, &env);
                        if completions.send(completion).is_err() {
                            // Dispatcher gone; the connection drops here.
                            break;
                        }
                        syscalls::notify_pipe(notify_wr);
                    }

                    tracing::debug!(worker = i, "worker exiting");
                })
                .map_err(HearthError::Io)?;
            handles.push(handle);
        }

        Ok(Self { handles })
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
