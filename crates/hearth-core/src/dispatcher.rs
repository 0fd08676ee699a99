// src/dispatcher.rs
//
// The single control thread: owns the epoll registration table, the
// connection slab, and the timer heap. Workers never touch any of
// them; results come back over the completion channel.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;

use crate::config::{Config, TriggerMode};
use crate::conn::Connection;
use crate::error::HearthResult;
use crate::metrics::ServerMetrics;
use crate::policy::{Completion, DispatchPolicy, Disposition, Phase, Task};
use crate::queue::TaskQueue;
use crate::slab::ConnectionSlab;
use crate::syscalls::{self, Epoll, epoll_event};
use crate::timer::{TimerEntry, TimerHeap, now_secs};

const TOKEN_LISTENER: u64 = u64::MAX;
const TOKEN_ALARM: u64 = u64::MAX - 1;
const TOKEN_NOTIFY: u64 = u64::MAX - 2;

/// Bounded wait so the shutdown flag is observed promptly.
const WAIT_MS: i32 = 500;

fn token_for(slot: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | slot as u64
}

fn split_token(token: u64) -> (usize, u32) {
    ((token & u32::MAX as u64) as usize, (token >> 32) as u32)
}

pub struct Dispatcher {
    epoll: Epoll,
    listen_fd: RawFd,
    slab: ConnectionSlab,
    timers: TimerHeap,
    queue: Arc<TaskQueue<Task>>,
    completions: Receiver<Completion>,
    alarm_rd: RawFd,
    notify_rd: RawFd,
    policy: Arc<dyn DispatchPolicy>,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<AtomicBool>,
    trigger: TriggerMode,
    timeslot: u64,
    idle_timeout: u64,
    max_events: usize,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listen_fd: RawFd,
        queue: Arc<TaskQueue<Task>>,
        completions: Receiver<Completion>,
        alarm_rd: RawFd,
        notify_rd: RawFd,
        policy: Arc<dyn DispatchPolicy>,
        metrics: Arc<ServerMetrics>,
        shutdown: Arc<AtomicBool>,
        config: &Config,
    ) -> HearthResult<Self> {
        let epoll = Epoll::new()?;
        epoll.add(listen_fd, TOKEN_LISTENER, syscalls::interest(true, false, false, false))?;
        epoll.add(alarm_rd, TOKEN_ALARM, syscalls::interest(true, false, false, false))?;
        epoll.add(notify_rd, TOKEN_NOTIFY, syscalls::interest(true, false, false, false))?;

        Ok(Self {
            epoll,
            listen_fd,
            slab: ConnectionSlab::new(config.max_connections),
            timers: TimerHeap::new(),
            queue,
            completions,
            alarm_rd,
            notify_rd,
            policy,
            metrics,
            shutdown,
            trigger: config.trigger,
            timeslot: config.timeslot_secs,
            idle_timeout: config.idle_timeout_secs(),
            max_events: config.max_events,
        })
    }

    pub fn run(&mut self) -> HearthResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.max_events];

        while !self.shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, WAIT_MS)?;
            for event in &events[..n] {
                let (token, readiness) = (event.u64, event.events);
                match token {
                    TOKEN_LISTENER => self.accept_ready(),
                    TOKEN_ALARM => {
                        syscalls::drain_pipe(self.alarm_rd);
                        self.sweep_idle();
                        syscalls::rearm_alarm(self.timeslot);
                    }
                    TOKEN_NOTIFY => syscalls::drain_pipe(self.notify_rd),
                    _ => self.client_ready(token, readiness),
                }
            }
            self.drain_completions();
        }

        self.shutdown_cleanup();
        Ok(())
    }

    /// Accept until the backlog is drained.
    fn accept_ready(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(None) => break,
                Ok(Some((fd, peer))) => {
                    let conn = Connection::new(fd, peer, self.trigger);
                    match self.slab.insert(conn) {
                        Err(conn) => {
                            tracing::warn!(peer = %conn.peer(), "connection capacity reached");
                            drop(conn);
                        }
                        Ok((slot, generation)) => {
                            let events = syscalls::interest(
                                true,
                                false,
                                self.trigger == TriggerMode::Edge,
                                true,
                            );
                            if let Err(e) = self.epoll.add(fd, token_for(slot, generation), events) {
                                tracing::warn!(fd, error = %e, "readiness registration failed");
                                drop(self.slab.release(slot, generation));
                                continue;
                            }
                            self.metrics.inc_conn();
                            self.timers.insert(TimerEntry {
                                expire: now_secs() + self.idle_timeout,
                                slot,
                                generation,
                            });
                            tracing::info!(fd, peer = %peer, "connection accepted");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn client_ready(&mut self, token: u64, readiness: u32) {
        let (slot, generation) = split_token(token);
        if !self.slab.valid(slot, generation) {
            return;
        }
        if syscalls::is_hangup(readiness) {
            self.teardown(slot, generation, None);
            return;
        }

        let phase = if syscalls::is_readable(readiness) {
            Phase::Read
        } else if syscalls::is_writable(readiness) {
            Phase::Write
        } else {
            return;
        };

        let Some(conn) = self.slab.check_out(slot, generation) else {
            return;
        };
        let task = Task {
            slot,
            generation,
            phase,
            conn,
        };
        let disposition = match phase {
            Phase::Read => self.policy.read_ready(task, &self.queue, &self.metrics),
            Phase::Write => self.policy.write_ready(task, &self.queue, &self.metrics),
        };
        self.apply(slot, generation, disposition);
    }

    /// Sweep completions reported by workers since the last iteration.
    fn drain_completions(&mut self) {
        while let Ok(done) = self.completions.try_recv() {
            let Completion {
                slot,
                generation,
                conn,
                outcome,
            } = done;
            let disposition = match outcome {
                crate::policy::Outcome::AwaitRead => Disposition::Await(conn, Phase::Read),
                crate::policy::Outcome::AwaitWrite => Disposition::Await(conn, Phase::Write),
                crate::policy::Outcome::NextRequest => Disposition::NextRequest(conn),
                crate::policy::Outcome::Teardown => Disposition::Teardown(conn),
            };
            self.apply(slot, generation, disposition);
        }
    }

    fn apply(&mut self, slot: usize, generation: u32, disposition: Disposition) {
        match disposition {
            Disposition::Submitted => {}
            Disposition::Await(conn, phase) => self.rearm(slot, generation, conn, phase),
            Disposition::NextRequest(conn) => self.rearm(slot, generation, conn, Phase::Read),
            Disposition::Teardown(conn) => self.teardown(slot, generation, Some(conn)),
        }
    }

    /// Put the connection back, re-arm its one-shot interest for the
    /// next phase, and refresh its idle timer: it showed activity.
    fn rearm(&mut self, slot: usize, generation: u32, conn: Box<Connection>, phase: Phase) {
        let fd = conn.fd();
        if let Err(conn) = self.slab.check_in(slot, generation, conn) {
            tracing::error!(fd = conn.fd(), "stale connection returned; closing");
            let _ = self.epoll.delete(conn.fd());
            return;
        }
        let events = syscalls::interest(
            phase == Phase::Read,
            phase == Phase::Write,
            self.trigger == TriggerMode::Edge,
            true,
        );
        if let Err(e) = self.epoll.modify(fd, token_for(slot, generation), events) {
            tracing::warn!(fd, error = %e, "re-arm failed");
            self.teardown(slot, generation, None);
            return;
        }
        self.touch(slot, generation);
    }

    fn touch(&mut self, slot: usize, generation: u32) {
        let expire = now_secs() + self.idle_timeout;
        if !self.timers.adjust(slot, generation, expire) {
            self.timers.insert(TimerEntry { expire, slot, generation });
        }
    }

    /// Deregister, close and forget a connection. `conn` is `Some` when
    /// the caller already holds it (a finished step); `None` takes it
    /// from the slab.
    fn teardown(&mut self, slot: usize, generation: u32, conn: Option<Box<Connection>>) {
        let conn = conn.or_else(|| self.slab.check_out(slot, generation));
        let Some(conn) = conn else {
            return;
        };
        let _ = self.epoll.delete(conn.fd());
        tracing::info!(fd = conn.fd(), peer = %conn.peer(), "connection closed");
        drop(conn);
        self.slab.release(slot, generation);
        self.timers.remove(slot, generation);
        self.metrics.dec_conn();
    }

    /// Expire idle connections. A connection currently checked out to a
    /// worker is mid-step, not idle: its timer is pushed out one slot
    /// instead of closing under the worker.
    fn sweep_idle(&mut self) {
        let now = now_secs();
        let mut deferred: Vec<TimerEntry> = Vec::new();
        {
            let Self {
                timers,
                slab,
                epoll,
                metrics,
                ..
            } = self;
            timers.tick(now, |entry| {
                if slab.is_checked_out(entry.slot, entry.generation) {
                    deferred.push(entry);
                } else if let Some(conn) = slab.check_out(entry.slot, entry.generation) {
                    let _ = epoll.delete(conn.fd());
                    tracing::info!(fd = conn.fd(), peer = %conn.peer(), "idle connection evicted");
                    drop(conn);
                    slab.release(entry.slot, entry.generation);
                    metrics.dec_conn();
                    metrics.inc_evicted();
                }
            });
        }
        for entry in deferred {
            self.timers.insert(TimerEntry {
                expire: now + self.timeslot,
                ..entry
            });
        }
    }

    fn shutdown_cleanup(&mut self) {
        self.queue.close();
        for conn in self.slab.drain() {
            let _ = self.epoll.delete(conn.fd());
            self.metrics.dec_conn();
        }
    }
}
