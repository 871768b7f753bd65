use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::codec::HEARTBEAT_PROBE;
use crate::connection::WeakConnection;
use crate::pipeline::{Stage, StageContext, StageId};

/// How often idleness is checked, independent of the keep-alive interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

struct HeartbeatState {
    last_write: Instant,
    scheduled: Option<AbortHandle>,
}

/// Writes [`HEARTBEAT_PROBE`] whenever nothing has been written for longer than
/// the keep-alive interval.
///
/// Lock order is always the connection lock, then the heartbeat state.
pub struct HeartbeatStage {
    interval: Duration,
    check_interval: Duration,
    state: Arc<Mutex<HeartbeatState>>,
}

impl HeartbeatStage {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            check_interval: DEFAULT_CHECK_INTERVAL,
            state: Arc::new(Mutex::new(HeartbeatState {
                last_write: Instant::now(),
                scheduled: None,
            })),
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    fn cancel(&self) {
        if let Some(handle) = self.state.lock().scheduled.take() {
            handle.abort();
        }
    }
}

impl Stage for HeartbeatStage {
    fn on_added(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        let timer = Arc::new(HeartbeatTimer {
            connection: ctx.connection(),
            stage_id: ctx.stage_id(),
            interval: self.interval,
            check_interval: self.check_interval,
            state: self.state.clone(),
        });

        let mut state = self.state.lock();
        state.last_write = Instant::now();
        timer.schedule(&mut state);
        Ok(())
    }

    fn on_removed(&mut self) {
        self.cancel();
    }

    fn on_write(&mut self, ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        self.state.lock().last_write = Instant::now();
        ctx.write(data)
    }

    fn on_closed(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        self.cancel();
        ctx.fire_closed()
    }
}

struct HeartbeatTimer {
    connection: WeakConnection,
    stage_id: StageId,
    interval: Duration,
    check_interval: Duration,
    state: Arc<Mutex<HeartbeatState>>,
}

impl HeartbeatTimer {
    fn schedule(self: &Arc<Self>, state: &mut HeartbeatState) {
        if let Some(handle) = state.scheduled.take() {
            handle.abort();
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("No tokio runtime available, heartbeat disabled");
                return;
            }
        };

        let timer = self.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(timer.check_interval).await;
            timer.run_check();
        });
        state.scheduled = Some(task.abort_handle());
    }

    fn run_check(self: &Arc<Self>) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };

        connection.with_pipeline(|pipeline| {
            let send_probe = {
                let mut state = self.state.lock();
                state.scheduled = None;
                if !pipeline.is_open() || !pipeline.contains_stage(self.stage_id) {
                    return;
                }
                let now = Instant::now();
                let idle = now.duration_since(state.last_write) > self.interval;
                if idle {
                    state.last_write = now;
                }
                idle
            };

            // the state lock is released here, the write may close the pipeline
            if send_probe {
                log::trace!(
                    "Connection idle for over {:?}, sending heartbeat",
                    self.interval
                );
                let probe = Bytes::from_static(&HEARTBEAT_PROBE);
                if let Err(e) = pipeline.write_from(self.stage_id, probe) {
                    log::warn!("Failed to send heartbeat: {e}");
                }
            }

            if pipeline.is_open() && pipeline.contains_stage(self.stage_id) {
                self.schedule(&mut self.state.lock());
            }
        });
    }
}
