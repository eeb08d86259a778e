//! The single worker every kernel mutation goes through.
//!
//! Requests are handed over a channel of capacity one, so producers wait
//! until the worker has room. The worker owns the [`Redirector`] and runs on
//! its own OS thread: namespace switches are per thread and must not leak
//! into the runtime serving the API.

use std::io;
use std::thread::{self, JoinHandle};

use prometheus_client::metrics::counter::Counter;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use ztunnel_redirect_common::WorkloadInfo;

use crate::error::RedirectError;
use crate::netns::NetnsExec;
use crate::redirect::{RedirectArgs, Redirector};
use crate::tables::{LogLevel, WorkloadEntry};
use crate::tc::TcBackend;

const WORKER_THREAD: &str = "redirect-worker";

#[derive(Clone, Debug)]
pub enum Command {
    Redirect(RedirectArgs),
    SetLogLevel(LogLevel),
    UpdateHostIps(Vec<String>),
    DumpWorkloads,
    DumpZtunnel,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Redirect(_) => "redirect",
            Command::SetLogLevel(_) => "set_log_level",
            Command::UpdateHostIps(_) => "update_host_ips",
            Command::DumpWorkloads => "dump_workloads",
            Command::DumpZtunnel => "dump_ztunnel",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    Workloads(Vec<WorkloadEntry>),
    Ztunnel(WorkloadInfo),
}

type ReplySender = oneshot::Sender<Result<Reply, RedirectError>>;

struct Envelope {
    command: Command,
    reply: Option<ReplySender>,
}

/// Counters kept by the worker.
#[derive(Clone, Debug, Default)]
pub struct WorkerMetrics {
    pub processed: Counter,
    pub failed: Counter,
}

/// Producer side of the queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RedirectHandle {
    tx: mpsc::Sender<Envelope>,
}

impl RedirectHandle {
    /// Queues a redirect without waiting for its outcome, which the worker
    /// only logs. Waits while the worker is busy.
    pub async fn accept_request(&self, args: RedirectArgs) -> Result<(), RedirectError> {
        self.tx
            .send(Envelope {
                command: Command::Redirect(args),
                reply: None,
            })
            .await
            .map_err(|_| RedirectError::ServerStopped)
    }

    /// Queues `command` and waits for the worker to run it.
    pub async fn call(&self, command: Command) -> Result<Reply, RedirectError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RedirectError::ServerStopped)?;
        // Dropped unanswered when the worker shuts down with it still queued.
        rx.await.map_err(|_| RedirectError::ServerStopped)?
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("command", &self.command.name())
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

pub struct RedirectServer {
    handle: RedirectHandle,
    shutdown: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl RedirectServer {
    /// Moves `redirector` onto the worker thread and starts taking requests.
    pub fn start<K>(redirector: Redirector<K>, metrics: WorkerMetrics) -> io::Result<Self>
    where
        K: TcBackend + NetnsExec + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = thread::Builder::new()
            .name(WORKER_THREAD.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(run(redirector, rx, shutdown_rx, metrics));
            })?;

        info!("redirect server started");
        Ok(Self {
            handle: RedirectHandle { tx },
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> RedirectHandle {
        self.handle.clone()
    }

    /// Signals the worker and waits for it to exit. Requests still queued
    /// are dropped unprocessed. Blocks the calling thread.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("redirect worker panicked");
            }
        }
        info!("redirect server stopped");
    }
}

async fn run<K: TcBackend + NetnsExec>(
    mut redirector: Redirector<K>,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    metrics: WorkerMetrics,
) {
    loop {
        tokio::select! {
            biased;
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            envelope = rx.recv() => {
                let Some(Envelope { command, reply }) = envelope else {
                    break;
                };
                let name = command.name();
                let result = dispatch(&mut redirector, command);
                metrics.processed.inc();
                match &result {
                    Ok(_) => debug!(command = name, "request processed"),
                    Err(e) => {
                        metrics.failed.inc();
                        error!(command = name, error = %e, "request failed");
                    }
                }
                if let Some(reply) = reply {
                    // The caller may have given up waiting.
                    let _ = reply.send(result);
                }
            }
        }
    }
    debug!("redirect worker exiting");
    // Dropping the redirector closes the program and map handles.
}

fn dispatch<K: TcBackend + NetnsExec>(
    redirector: &mut Redirector<K>,
    command: Command,
) -> Result<Reply, RedirectError> {
    match command {
        Command::Redirect(args) => redirector.handle_request(&args).map(|()| Reply::Done),
        Command::SetLogLevel(level) => {
            redirector.tables_mut().set_log_level(level)?;
            info!(?level, "ebpf log level updated");
            Ok(Reply::Done)
        }
        Command::UpdateHostIps(ips) => {
            redirector.tables_mut().update_host_ips(ips.as_slice())?;
            info!(?ips, "host ips updated");
            Ok(Reply::Done)
        }
        Command::DumpWorkloads => redirector.tables().dump_app_info().map(Reply::Workloads),
        Command::DumpZtunnel => redirector.tables().dump_ztunnel_info().map(Reply::Ztunnel),
    }
}
