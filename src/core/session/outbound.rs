// src/core/session/outbound.rs

//! The per-link outbound command queue.
//!
//! Many producers enqueue; a single writer task owns the sink half of the
//! link and writes commands strictly in enqueue order, one at a time. When the
//! queue sits idle for the configured timeout the writer calls
//! [`QueueHooks::on_idle`], which sessions use to emit keep-alive pings.

use crate::core::protocol::Command;
use crate::core::{SessionError, metrics};
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long `stop` waits for pending commands to drain before discarding them.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks invoked from the writer task.
///
/// Both run on the writer task itself, so an implementation must not wait for
/// the queue to stop; spawn that work instead.
pub trait QueueHooks: Send + Sync + 'static {
    /// The queue was empty for a whole idle timeout.
    fn on_idle(&self);

    /// Writing to the sink failed. The writer has exited.
    fn on_write_failed(&self, error: &SessionError);
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<Command>,
    running: bool,
    started: bool,
}

struct QueueShared {
    inner: Mutex<QueueInner>,
    notify: Notify,
    timeout_ms: AtomicU64,
}

/// A FIFO of commands waiting to be written to one link.
pub struct OutboundQueue {
    shared: Arc<QueueShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundQueue {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                inner: Mutex::new(QueueInner::default()),
                notify: Notify::new(),
                timeout_ms: AtomicU64::new(duration_ms(idle_timeout)),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawns the writer task. A queue can be started only once.
    pub fn start<W>(&self, sink: W, hooks: Arc<dyn QueueHooks>) -> Result<(), SessionError>
    where
        W: Sink<Command, Error = SessionError> + Send + Unpin + 'static,
    {
        {
            let mut inner = self.shared.inner.lock();
            if inner.started {
                return Err(SessionError::InvalidState(
                    "outbound queue was already started".into(),
                ));
            }
            inner.started = true;
            inner.running = true;
        }
        let handle = tokio::spawn(write_loop(self.shared.clone(), sink, hooks));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Appends a command. Fails if the queue is not started or is stopping,
    /// or if the command exceeds the frame limits.
    pub fn enqueue(&self, command: Command) -> Result<(), SessionError> {
        command.validate()?;
        {
            let mut inner = self.shared.inner.lock();
            if !inner.running {
                return Err(SessionError::QueueNotRunning);
            }
            inner.pending.push_back(command);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Changes the idle interval. Takes effect from the writer's next wait.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared
            .timeout_ms
            .store(duration_ms(timeout), Ordering::Relaxed);
        self.shared.notify.notify_one();
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.shared.timeout_ms.load(Ordering::Relaxed))
    }

    /// Drops every command that has not been written yet.
    pub fn clear(&self) {
        self.shared.inner.lock().pending.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().running
    }

    /// Stops accepting commands and lets the writer flush what is queued.
    ///
    /// Delivery is best effort: after [`DRAIN_TIMEOUT`] the remainder is
    /// discarded and the writer is aborted.
    pub async fn stop(&self) {
        self.shared.inner.lock().running = false;
        self.shared.notify.notify_one();

        let handle = self.task.lock().take();
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            let dropped = {
                let mut inner = self.shared.inner.lock();
                let n = inner.pending.len();
                inner.pending.clear();
                n
            };
            warn!("Outbound queue did not drain in time; discarding {dropped} command(s).");
            handle.abort();
        }
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

enum Step {
    Write(Command),
    Finish,
    Wait,
}

async fn write_loop<W>(shared: Arc<QueueShared>, mut sink: W, hooks: Arc<dyn QueueHooks>)
where
    W: Sink<Command, Error = SessionError> + Send + Unpin + 'static,
{
    loop {
        let step = {
            let mut inner = shared.inner.lock();
            match inner.pending.pop_front() {
                Some(command) => Step::Write(command),
                None if !inner.running => Step::Finish,
                None => Step::Wait,
            }
        };

        match step {
            Step::Write(command) => {
                debug!("Writing command {}", command.name());
                if let Err(e) = sink.send(command).await {
                    {
                        let mut inner = shared.inner.lock();
                        inner.running = false;
                        inner.pending.clear();
                    }
                    hooks.on_write_failed(&e);
                    return;
                }
                metrics::COMMANDS_SENT_TOTAL.inc();
            }
            Step::Finish => {
                if let Err(e) = sink.close().await {
                    debug!("Closing outbound sink failed: {e}");
                }
                return;
            }
            Step::Wait => {
                let timeout = Duration::from_millis(shared.timeout_ms.load(Ordering::Relaxed));
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep(timeout) => hooks.on_idle(),
                }
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
