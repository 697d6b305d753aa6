//! Background changelog writer
//!
//! Appends are queued to a dedicated thread which drains the queue, writes
//! every record, syncs each touched segment once and only then resolves the
//! per-append futures. Seal and truncate requests travel through the same
//! queue so they observe every append queued before them.

use crate::changelog::ChangeLogHandle;
use bytes::Bytes;
use cellmaster_common::config::ChangeLogSyncMode;
use cellmaster_common::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Resolves once the queued operation is durable.
pub type FlushFuture = BoxFuture<'static, Result<()>>;

const MAX_COMMANDS_PER_FLUSH: usize = 1024;

enum Command {
    Append {
        log: ChangeLogHandle,
        record_id: u32,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Seal {
        log: ChangeLogHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    Truncate {
        log: ChangeLogHandle,
        record_count: u32,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the writer thread. Dropping it drains the queue and joins the thread.
pub struct AsyncChangeLogWriter {
    tx: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncChangeLogWriter {
    /// Spawn the writer thread.
    pub fn start(name: &str, sync_mode: ChangeLogSyncMode) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sync = sync_mode == ChangeLogSyncMode::OnFlush;
        let thread = std::thread::Builder::new()
            .name(format!("{name}-changelog"))
            .spawn(move || run(&rx, sync))?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    fn submit(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> FlushFuture {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .as_ref()
            .is_some_and(|tx| tx.send(make(reply)).is_ok());
        if !sent {
            return futures::future::ready(Err(stopped())).boxed();
        }
        rx.map(|result| result.unwrap_or_else(|_| Err(stopped())))
            .boxed()
    }

    /// Queue a record append.
    pub fn append(&self, log: &ChangeLogHandle, record_id: u32, data: Bytes) -> FlushFuture {
        let log = log.clone();
        self.submit(move |reply| Command::Append {
            log,
            record_id,
            data,
            reply,
        })
    }

    /// Queue sealing of a segment after all appends queued so far.
    pub fn seal(&self, log: &ChangeLogHandle) -> FlushFuture {
        let log = log.clone();
        self.submit(move |reply| Command::Seal { log, reply })
    }

    /// Queue a truncation of a segment after all appends queued so far.
    pub fn truncate(&self, log: &ChangeLogHandle, record_count: u32) -> FlushFuture {
        let log = log.clone();
        self.submit(move |reply| Command::Truncate {
            log,
            record_count,
            reply,
        })
    }
}

impl Drop for AsyncChangeLogWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Changelog writer thread panicked");
            }
        }
    }
}

fn stopped() -> Error {
    Error::ChangeLog("changelog writer is stopped".into())
}

/// Appends written but not yet flushed.
#[derive(Default)]
struct PendingAppends {
    dirty: Vec<ChangeLogHandle>,
    waiters: Vec<(oneshot::Sender<Result<()>>, std::result::Result<(), String>)>,
}

impl PendingAppends {
    fn mark_dirty(&mut self, log: &ChangeLogHandle) {
        if !self.dirty.iter().any(|l| Arc::ptr_eq(l, log)) {
            self.dirty.push(log.clone());
        }
    }

    fn flush(&mut self, sync: bool) {
        let mut flush_error = None;
        for log in self.dirty.drain(..) {
            if let Err(e) = log.lock().flush(sync) {
                error!(error = %e, "Changelog flush failed");
                flush_error = Some(e.to_string());
            }
        }
        let count = self.waiters.len();
        for (reply, result) in self.waiters.drain(..) {
            let result = match (result, &flush_error) {
                (Err(msg), _) => Err(Error::ChangeLog(msg)),
                (Ok(()), Some(msg)) => Err(Error::ChangeLog(msg.clone())),
                (Ok(()), None) => Ok(()),
            };
            let _ = reply.send(result);
        }
        if count > 0 {
            debug!(records = count, sync, "Changelog records flushed");
        }
    }
}

fn run(rx: &Receiver<Command>, sync: bool) {
    let mut pending = PendingAppends::default();
    while let Ok(first) = rx.recv() {
        let mut command = Some(first);
        let mut processed = 0;
        while let Some(current) = command.take() {
            processed += 1;
            match current {
                Command::Append {
                    log,
                    record_id,
                    data,
                    reply,
                } => {
                    let result = log
                        .lock()
                        .append(record_id, &data)
                        .map_err(|e| e.to_string());
                    pending.mark_dirty(&log);
                    pending.waiters.push((reply, result));
                }
                Command::Seal { log, reply } => {
                    pending.flush(sync);
                    let _ = reply.send(log.lock().seal());
                }
                Command::Truncate {
                    log,
                    record_count,
                    reply,
                } => {
                    pending.flush(sync);
                    let _ = reply.send(log.lock().truncate(record_count));
                }
            }
            if processed < MAX_COMMANDS_PER_FLUSH {
                command = rx.try_recv().ok();
            }
        }
        pending.flush(sync);
    }
    debug!("Changelog writer stopped");
}
