// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs work on a dedicated thread with its own single-threaded run loop.
//!
//! The control surface of an instance must be driven from the thread that created it, so each
//! batch attempt (acquire, run, release) runs start to finish on one named OS thread.

use crate::errors::ExecutorError;
use std::{any::Any, future::Future, thread, time::Duration};
use tokio::{runtime, sync::oneshot, task::LocalSet};
use tracing::{debug, warn};

/// Spawns one thread per call to [`run`](Self::run).
#[derive(Clone, Debug)]
pub(super) struct AffinityExecutor {
    thread_name: String,
    work_timeout: Duration,
    join_timeout: Duration,
}

/// Why work on the affinity thread did not produce a result.
#[derive(Debug)]
pub(super) enum AffinityError {
    /// The thread failed.
    Executor(ExecutorError),

    /// The work did not complete within the timeout. The thread is left running.
    TimedOut(Duration),
}

impl AffinityExecutor {
    pub(super) fn new(
        thread_name: impl Into<String>,
        work_timeout: Duration,
        join_timeout: Duration,
    ) -> Self {
        Self {
            thread_name: thread_name.into(),
            work_timeout,
            join_timeout,
        }
    }

    /// Runs `work` on a fresh thread and waits for its result.
    ///
    /// The future produced by `work` does not need to be `Send`: it is created and polled on the
    /// affinity thread only.
    pub(super) async fn run<W, Fut, T>(&self, work: W) -> Result<T, AffinityError>
    where
        W: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                let _exit = ExitNotify(Some(exit_tx));
                let _ = result_tx.send(run_on_current_thread(work));
            })
            .map_err(|error| AffinityError::Executor(ExecutorError::Spawn(error)))?;

        let outcome = match tokio::time::timeout(self.work_timeout, result_rx).await {
            Ok(Ok(result)) => result.map_err(AffinityError::Executor),
            Ok(Err(_)) => Err(AffinityError::Executor(ExecutorError::Disconnected)),
            Err(_) => Err(AffinityError::TimedOut(self.work_timeout)),
        };

        match tokio::time::timeout(self.join_timeout, exit_rx).await {
            Ok(_) => {
                // The thread has finished its work and is about to return.
                if handle.join().is_err() {
                    warn!(thread = %self.thread_name, "affinity thread panicked while exiting");
                }
                debug!(thread = %self.thread_name, "affinity thread exited");
            }
            Err(_) => {
                let error = ExecutorError::JoinTimeout {
                    timeout: self.join_timeout,
                };
                warn!(thread = %self.thread_name, "{error}, detaching it");
            }
        }

        outcome
    }
}

fn run_on_current_thread<W, Fut, T>(work: W) -> Result<T, ExecutorError>
where
    W: FnOnce() -> Fut,
    Fut: Future<Output = T> + 'static,
    T: 'static,
{
    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ExecutorError::RuntimeCreate)?;
    let local = LocalSet::new();

    local
        .block_on(&runtime, async move { tokio::task::spawn_local(work()).await })
        .map_err(|error| {
            if error.is_panic() {
                ExecutorError::Panicked {
                    message: panic_message(error.into_panic()),
                }
            } else {
                ExecutorError::Disconnected
            }
        })
}

pub(super) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "(non-string panic payload)".to_owned(),
        },
    }
}

// Signals the waiting side when the thread is done, including on panic.
struct ExitNotify(Option<oneshot::Sender<()>>);

impl Drop for ExitNotify {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}
