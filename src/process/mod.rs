//! Process supervisor: owns the worker fleet, the cancellation token, and
//! the reload/interrupt signal policy (spec.md §4.7, §9 "Cooperative
//! shutdown").
//!
//! Replaces the original's ad-hoc `context.Context` + two raw signal
//! channels with one `CancellationToken` threaded through every worker and
//! a single task that owns the reload/interrupt policy.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-lived managed task: the SMTP listener fleet and the HTTP health
/// endpoint are both instances of this capability (spec.md §9
/// "Polymorphism over workers"), so the supervisor stays protocol-ignorant.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;
    async fn serve(&self, cancel: CancellationToken) -> Result<()>;
}

/// Builds one cycle's worker fleet, called again on every reload so fresh
/// config (new TLS material, limits, whitelist, auth users, listener set)
/// takes effect without a process restart (spec.md §4.7, scenario S7).
pub type WorkerFactory = Box<dyn Fn() -> Result<Vec<Arc<dyn Worker>>> + Send + Sync>;

/// Owns the worker factory, the shared cancellation token, and the
/// `restarting` flag that drives the reload loop.
pub struct Supervisor {
    factory: WorkerFactory,
    restarting: Arc<AtomicBool>,
}

impl Supervisor {
    /// Fixed worker list, never rebuilt. Reload signals still drain and
    /// restart the same workers; use [`Supervisor::with_factory`] when
    /// workers need to be rebuilt from fresh config on every cycle.
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Self {
        Supervisor {
            factory: Box::new(move || Ok(workers.clone())),
            restarting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Worker list rebuilt by `factory` at the start of every cycle,
    /// including the first.
    pub fn with_factory(factory: WorkerFactory) -> Self {
        Supervisor {
            factory,
            restarting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Loops while `restarting`: rebuild the worker fleet, spawn every
    /// worker against a fresh cancellation token, wait for them all to
    /// finish, then check whether a reload signal asked for another cycle.
    pub async fn start(&self) -> Result<()> {
        loop {
            self.restarting.store(false, Ordering::SeqCst);

            let workers = (self.factory)()?;
            let cancel = CancellationToken::new();
            let signals = tokio::spawn(handle_signals(cancel.clone(), self.restarting.clone()));

            let mut handles = Vec::with_capacity(workers.len());
            for worker in workers {
                let cancel = cancel.clone();
                let name = worker.name().to_string();
                handles.push(tokio::spawn(async move {
                    if let Err(e) = worker.serve(cancel.clone()).await {
                        error!(worker = name, error = %e, "worker failed, cancelling fleet for this cycle");
                        cancel.cancel();
                    }
                }));
            }

            for handle in handles {
                let _ = handle.await;
            }

            cancel.cancel();
            signals.abort();

            if !self.restarting.load(Ordering::SeqCst) {
                return Ok(());
            }

            info!("restarting worker fleet with reloaded configuration");
        }
    }
}

/// Owns the reload-class/interrupt-class signal policy for one cycle:
/// reload sets `restarting` and cancels; a first interrupt cancels without
/// restarting; a second interrupt within the same cycle force-exits.
async fn handle_signals(cancel: CancellationToken, restarting: Arc<AtomicBool>) {
    let mut reload = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGQUIT handler");
            return;
        }
    };

    tokio::select! {
        _ = reload.recv() => {
            info!("reload signal received, restarting fleet");
            restarting.store(true, Ordering::SeqCst);
            cancel.cancel();
        }
        _ = interrupt.recv() => {
            handle_interrupt(cancel, &mut interrupt, &mut quit).await;
        }
        _ = quit.recv() => {
            handle_interrupt(cancel, &mut interrupt, &mut quit).await;
        }
        _ = cancel.cancelled() => {}
    }
}

const FORCE_EXIT_CODE: i32 = 130;

async fn handle_interrupt(
    cancel: CancellationToken,
    interrupt: &mut tokio::signal::unix::Signal,
    quit: &mut tokio::signal::unix::Signal,
) {
    info!("interrupt received, draining in-flight sessions");
    cancel.cancel();

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = quit.recv() => {}
    }
    warn!("second interrupt received, forcing exit");
    std::process::exit(FORCE_EXIT_CODE);
}
