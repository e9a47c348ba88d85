//! Thread-model runtime: reconciles the models declared across the stack,
//! owns the process-wide locks, and fans one connection out over worker
//! threads.
//!
//! Model selection: the plugin declares the loosest model it tolerates and
//! every filter may declare something stricter; the engine runs at the
//! strictest of all of them. A TLS connection is additionally capped at
//! `SerializeRequests` because both transport halves share one TLS session.

use std::sync::Mutex;

use color_eyre::Result;
use log::debug;

use crate::backend::{Control, ThreadModel};
use crate::conn::Connection;
use crate::stack::Stack;
use crate::transmit::{self, TransmitCtx};

/// Most workers one parallel connection will run, however many cores the
/// machine has.
const MAX_WORKERS: usize = 16;

/// Process-wide locks backing the stricter thread models.
#[derive(Default)]
pub struct ServerLocks {
    /// Held across dispatch under `SerializeAllRequests` and stricter.
    pub all_requests: Mutex<()>,
    /// Held for a connection's lifetime under `SerializeConnections`.
    pub connections: Mutex<()>,
}

impl ServerLocks {
    /// Fresh, unlocked lock set.
    pub fn new() -> Self {
        Self::default()
    }
}

/// The model a connection actually runs at: the stack's strictest
/// declaration, tightened further for TLS transports.
pub fn effective_model(stack: &Stack, tls: bool) -> ThreadModel {
    let mut model = stack.thread_model();
    if tls {
        model = model.stricter(ThreadModel::SerializeRequests);
    }
    model
}

/// How many workers to run for a connection at `model`.
pub fn worker_count(model: ThreadModel, configured: Option<usize>) -> usize {
    match model {
        ThreadModel::Parallel => configured
            .unwrap_or_else(num_cpus::get)
            .clamp(1, MAX_WORKERS),
        _ => 1,
    }
}

/// Run the request loop for one negotiated connection, spawning workers
/// when the model allows several in-flight requests. Returns once every
/// worker has finished; the first transport error wins.
pub fn serve_connection(
    stack: &Stack,
    ctl: &Control,
    locks: &ServerLocks,
    conn: &Connection,
    configured_workers: Option<usize>,
) -> Result<()> {
    let model = effective_model(stack, conn.tls);
    let workers = worker_count(model, configured_workers);
    debug!(
        target: "nbd",
        "conn {}: thread model {:?}, {} worker(s)", conn.id, model, workers
    );
    let ctx = TransmitCtx {
        stack,
        ctl,
        model,
        all_requests: &locks.all_requests,
    };
    if workers == 1 {
        return transmit::run_loop(&ctx, conn);
    }
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| scope.spawn(|| transmit::run_loop(&ctx, conn)))
            .collect();
        let mut result = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    // one worker failing poisons the socket for all of
                    // them; make sure the rest stop reading
                    conn.request_disconnect();
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(_) => {
                    conn.request_disconnect();
                    if result.is_ok() {
                        result = Err(color_eyre::eyre::eyre!("request worker panicked"));
                    }
                }
            }
        }
        result
    })
}
