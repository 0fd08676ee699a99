// src/server.rs

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hearth_store::StorePool;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::HearthResult;
use crate::metrics::ServerMetrics;
use crate::policy::{self, WorkerEnv};
use crate::queue::TaskQueue;
use crate::syscalls;

pub struct Server {
    config: Config,
    store: Arc<StorePool>,
    listen_fd: RawFd,
    local: SocketAddr,
}

impl Server {
    /// Validate the configuration and bind the listener. All startup
    /// failures surface here or in `serve`, before any request is
    /// accepted.
    pub fn bind(config: Config, store: Arc<StorePool>) -> HearthResult<Self> {
        config.validate()?;
        let listen_fd = syscalls::create_listen_socket(&config.host, config.port)?;
        let local = syscalls::local_addr(listen_fd)?;
        Ok(Self {
            config,
            store,
            listen_fd,
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Run until `shutdown` is raised: spawn the worker pool, route
    /// SIGALRM into the dispatcher, then block on the event loop.
    pub fn serve(self, shutdown: Arc<AtomicBool>) -> HearthResult<()> {
        let metrics = Arc::new(ServerMetrics::new());
        let queue = Arc::new(TaskQueue::new(self.config.queue_capacity));
        let (completion_tx, completion_rx) = mpsc::channel();
        let (notify_rd, notify_wr) = syscalls::create_pipe()?;
        let (alarm_rd, alarm_wr) = syscalls::create_pipe()?;
        syscalls::install_alarm(alarm_wr, self.config.timeslot_secs)?;

        let policy = policy::policy_for(self.config.dispatch);
        let env = WorkerEnv {
            doc_root: self.config.doc_root.clone(),
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&metrics),
        };
        let workers = crate::worker::WorkerPool::spawn(
            self.config.effective_workers(),
            Arc::clone(&queue),
            completion_tx,
            notify_wr,
            env,
            Arc::clone(&policy),
        )?;

        tracing::info!(
            addr = %self.local,
            workers = self.config.effective_workers(),
            model = policy.name(),
            doc_root = %self.config.doc_root.display(),
            "serving"
        );

        let stopped = Arc::new(AtomicBool::new(false));
        let reporter = {
            let metrics = Arc::clone(&metrics);
            let stopped = Arc::clone(&stopped);
            thread::Builder::new()
                .name("hearth-metrics".to_string())
                .spawn(move || {
                    let mut slept = 0u64;
                    while !stopped.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(250));
                        slept += 250;
                        if slept >= 5_000 {
                            slept = 0;
                            tracing::info!(
                                active = metrics.active_conns.load(Ordering::Relaxed),
                                requests = metrics.requests.load(Ordering::Relaxed),
                                bytes = metrics.bytes_sent.load(Ordering::Relaxed),
                                evicted = metrics.evicted.load(Ordering::Relaxed),
                                "stats"
                            );
                        }
                    }
                })
                .ok()
        };

        let mut dispatcher = Dispatcher::new(
            self.listen_fd,
            Arc::clone(&queue),
            completion_rx,
            alarm_rd,
            notify_rd,
            policy,
            metrics,
            shutdown,
            &self.config,
        )?;
        let result = dispatcher.run();

        // Wind down: no more tasks, wake everyone, wait for the pool.
        syscalls::disarm_alarm();
        queue.close();
        workers.join();
        stopped.store(true, Ordering::Release);
        if let Some(handle) = reporter {
            let _ = handle.join();
        }
        drop(dispatcher);
        syscalls::close_fd(notify_rd);
        syscalls::close_fd(notify_wr);
        syscalls::close_fd(alarm_rd);
        syscalls::close_fd(alarm_wr);

        tracing::info!("server shut down");
        result
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}
