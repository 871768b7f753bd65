use std::io;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::pipeline::{Pipeline, StageChain, WireSink};
use crate::target::Target;

/// Shared handle to a connection's pipeline.
///
/// All events for one connection are serialized by the pipeline lock, whether
/// they come from the transport, the caller or a timer. Stage callbacks run
/// with the lock held and must not call back into the `Connection`.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<Pipeline>>,
}

#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<Mutex<Pipeline>>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    pub fn new(sink: impl WireSink + 'static, chain: StageChain) -> io::Result<Self> {
        let inner = Arc::new_cyclic(|weak| {
            Mutex::new(Pipeline::new(
                Box::new(sink),
                WeakConnection {
                    inner: weak.clone(),
                },
            ))
        });
        inner.lock().append_chain(chain)?;
        Ok(Self { inner })
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn connected(&self, target: Target) -> io::Result<()> {
        self.inner.lock().fire_connected(target)
    }

    pub fn read(&self, data: Bytes) -> io::Result<()> {
        self.inner.lock().fire_read(data)
    }

    pub fn error(&self, error: io::Error) -> io::Result<()> {
        self.inner.lock().fire_error(error)
    }

    pub fn closed(&self) -> io::Result<()> {
        self.inner.lock().fire_closed()
    }

    pub fn write(&self, data: Bytes) -> io::Result<()> {
        self.inner.lock().write(data)
    }

    pub fn close(&self) -> io::Result<()> {
        self.inner.lock().close()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_open()
    }

    pub fn contains_stage(&self, name: &str) -> bool {
        self.inner.lock().contains(name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .stage_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Runs `f` with the pipeline locked.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&mut Pipeline) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let pipeline = self.inner.lock();
        f.debug_struct("Connection")
            .field("target", &pipeline.target())
            .field("open", &pipeline.is_open())
            .field("stages", &pipeline.stage_names())
            .finish()
    }
}
