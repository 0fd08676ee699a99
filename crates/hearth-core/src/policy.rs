// src/policy.rs
//
// The two I/O-ownership disciplines as a strategy object selected once
// at startup. The dispatcher and the workers call through the trait;
// neither carries model conditionals in its hot loop.

use std::path::PathBuf;
use std::sync::Arc;

use hearth_store::StorePool;

use crate::config::DispatchModel;
use crate::conn::{Connection, ProcessResult, SendOutcome};
use crate::metrics::ServerMetrics;
use crate::queue::TaskQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Write,
}

/// One unit of work: a connection owned exclusively while in flight.
pub struct Task {
    pub slot: usize,
    pub generation: u32,
    pub phase: Phase,
    pub conn: Box<Connection>,
}

/// What the dispatcher should do once a step finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Await more request bytes.
    AwaitRead,
    /// A response is staged (or partially sent); await writability.
    AwaitWrite,
    /// Keep-alive response fully sent; await the next request.
    NextRequest,
    Teardown,
}

/// A finished worker step, carrying the connection back.
pub struct Completion {
    pub slot: usize,
    pub generation: u32,
    pub conn: Box<Connection>,
    pub outcome: Outcome,
}

/// Dispatcher-side verdict for a readiness event.
pub enum Disposition {
    /// Handed to the worker pool; a completion will come back.
    Submitted,
    /// Keep the connection and re-arm readiness for `phase`.
    Await(Box<Connection>, Phase),
    /// Keep-alive response done (connection already reset); re-arm read.
    NextRequest(Box<Connection>),
    Teardown(Box<Connection>),
}

/// Everything a worker step needs besides the connection itself.
pub struct WorkerEnv {
    pub doc_root: PathBuf,
    pub store: Arc<StorePool>,
    pub metrics: Arc<ServerMetrics>,
}

pub trait DispatchPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// A registered socket became readable.
    fn read_ready(&self, task: Task, queue: &TaskQueue<Task>, metrics: &ServerMetrics)
    -> Disposition;

    /// A registered socket became writable.
    fn write_ready(
        &self,
        task: Task,
        queue: &TaskQueue<Task>,
        metrics: &ServerMetrics,
    ) -> Disposition;

    /// Execute one dequeued task on a worker thread.
    fn run_task(&self, task: Task, env: &WorkerEnv) -> Completion;
}

pub fn policy_for(model: DispatchModel) -> Arc<dyn DispatchPolicy> {
    match model {
        DispatchModel::Delegated => Arc::new(DelegatedIo),
        DispatchModel::WorkerOwned => Arc::new(WorkerOwnedIo),
    }
}

fn submit(queue: &TaskQueue<Task>, task: Task) -> Disposition {
    let phase = task.phase;
    match queue.push(task) {
        Ok(()) => Disposition::Submitted,
        Err(task) => {
            // Backpressure: drop the event, keep the connection armed;
            // the next wakeup retries.
            tracing::warn!(fd = task.conn.fd(), "task queue full, deferring");
            Disposition::Await(task.conn, phase)
        }
    }
}

fn process_to_completion(mut task: Task, env: &WorkerEnv) -> Completion {
    let outcome = match task
        .conn
        .process(&env.doc_root, &env.store, &env.metrics)
    {
        ProcessResult::NeedMore => Outcome::AwaitRead,
        ProcessResult::ResponseReady => Outcome::AwaitWrite,
        ProcessResult::Teardown => Outcome::Teardown,
    };
    Completion {
        slot: task.slot,
        generation: task.generation,
        conn: task.conn,
        outcome,
    }
}

fn send_step(conn: &mut Connection, metrics: &ServerMetrics) -> Outcome {
    match conn.send_response() {
        Ok(SendOutcome::Retry { written }) => {
            metrics.add_bytes(written);
            Outcome::AwaitWrite
        }
        Ok(SendOutcome::Done {
            keep_alive,
            written,
        }) => {
            metrics.add_bytes(written);
            if keep_alive {
                Outcome::NextRequest
            } else {
                Outcome::Teardown
            }
        }
        Err(e) => {
            tracing::info!(fd = conn.fd(), error = %e, "send failed");
            Outcome::Teardown
        }
    }
}

/// Reactor-style: the dispatcher moves the bytes, workers only parse
/// and build. Write readiness is serviced entirely on the dispatcher;
/// no write task reaches the pool.
pub struct DelegatedIo;

impl DispatchPolicy for DelegatedIo {
    fn name(&self) -> &'static str {
        "delegated-io"
    }

    fn read_ready(
        &self,
        mut task: Task,
        queue: &TaskQueue<Task>,
        _metrics: &ServerMetrics,
    ) -> Disposition {
        match task.conn.fill_read_buffer() {
            Ok(()) => submit(queue, task),
            Err(e) => {
                tracing::info!(fd = task.conn.fd(), reason = ?e, "read step failed");
                Disposition::Teardown(task.conn)
            }
        }
    }

    fn write_ready(
        &self,
        mut task: Task,
        _queue: &TaskQueue<Task>,
        metrics: &ServerMetrics,
    ) -> Disposition {
        match send_step(&mut task.conn, metrics) {
            Outcome::AwaitWrite => Disposition::Await(task.conn, Phase::Write),
            Outcome::NextRequest => Disposition::NextRequest(task.conn),
            _ => Disposition::Teardown(task.conn),
        }
    }

    fn run_task(&self, task: Task, env: &WorkerEnv) -> Completion {
        debug_assert_eq!(task.phase, Phase::Read);
        process_to_completion(task, env)
    }
}

/// Workers own the whole step: the dispatcher enqueues on readiness and
/// the worker reads or writes with exclusive, uninterrupted ownership.
pub struct WorkerOwnedIo;

impl DispatchPolicy for WorkerOwnedIo {
    fn name(&self) -> &'static str {
        "worker-owned-io"
    }

    fn read_ready(
        &self,
        task: Task,
        queue: &TaskQueue<Task>,
        _metrics: &ServerMetrics,
    ) -> Disposition {
        submit(queue, task)
    }

    fn write_ready(
        &self,
        task: Task,
        queue: &TaskQueue<Task>,
        _metrics: &ServerMetrics,
    ) -> Disposition {
        submit(queue, task)
    }

    fn run_task(&self, mut task: Task, env: &WorkerEnv) -> Completion {
        match task.phase {
            Phase::Read => {
                if let Err(e) = task.conn.fill_read_buffer() {
                    tracing::info!(fd = task.conn.fd(), reason = ?e, "read step failed");
                    return Completion {
                        slot: task.slot,
                        generation: task.generation,
                        conn: task.conn,
                        outcome: Outcome::Teardown,
                    };
                }
                process_to_completion(task, env)
            }
            Phase::Write => {
                let outcome = send_step(&mut task.conn, &env.metrics);
                Completion {
                    slot: task.slot,
                    generation: task.generation,
                    conn: task.conn,
                    outcome,
                }
            }
        }
    }
}
