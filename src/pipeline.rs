//! Ordered stage pipeline bound to a single connection.
//!
//! Index 0 is the wire side. Inbound events (connected, read, error, closed)
//! travel towards the end of the pipeline, outbound events (write, close)
//! travel towards index 0 and then into the [`WireSink`].
//!
//! A stage whose callback is running is detached from its slot. Events that
//! reach it re-entrantly are queued on the slot and delivered once the running
//! callback returns, so callbacks never nest on the same stage.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::WeakConnection;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(u64);

/// One processing step. Every callback defaults to passing the event along.
pub trait Stage: Send {
    fn on_added(&mut self, _ctx: &mut StageContext<'_>) -> io::Result<()> {
        Ok(())
    }

    /// Called once the stage has been taken out of the pipeline.
    fn on_removed(&mut self) {}

    fn on_connected(&mut self, ctx: &mut StageContext<'_>, target: Target) -> io::Result<()> {
        ctx.fire_connected(target)
    }

    fn on_read(&mut self, ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        ctx.fire_read(data)
    }

    fn on_error(&mut self, ctx: &mut StageContext<'_>, error: io::Error) -> io::Result<()> {
        ctx.fire_error(error)
    }

    fn on_closed(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        ctx.fire_closed()
    }

    fn on_write(&mut self, ctx: &mut StageContext<'_>, data: Bytes) -> io::Result<()> {
        ctx.write(data)
    }

    fn on_close(&mut self, ctx: &mut StageContext<'_>) -> io::Result<()> {
        ctx.close()
    }
}

/// Where outbound bytes leave the pipeline.
pub trait WireSink: Send {
    fn send(&mut self, data: Bytes) -> io::Result<()>;

    fn close(&mut self);
}

/// Named stages to be appended in order, e.g. the caller's protocol handlers.
#[derive(Default)]
pub struct StageChain {
    stages: Vec<(String, Box<dyn Stage>)>,
}

impl StageChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, stage: impl Stage + 'static) -> Self {
        self.push(name, Box::new(stage));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, stage: Box<dyn Stage>) {
        self.stages.push((name.into(), stage));
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

enum Event {
    Connected(Target),
    Read(Bytes),
    Error(io::Error),
    Closed,
    Write(Bytes),
    Close,
}

impl Event {
    fn is_inbound(&self) -> bool {
        matches!(
            self,
            Event::Connected(_) | Event::Read(_) | Event::Error(_) | Event::Closed
        )
    }
}

enum Invocation {
    Added,
    Event(Event),
}

struct Slot {
    id: StageId,
    name: String,
    // None while the stage's own callback is running.
    stage: Option<Box<dyn Stage>>,
    deferred: VecDeque<Event>,
    removed: bool,
}

pub struct Pipeline {
    slots: Vec<Slot>,
    sink: Box<dyn WireSink>,
    next_id: u64,
    open: bool,
    target: Option<Target>,
    connection: WeakConnection,
}

impl Pipeline {
    pub(crate) fn new(sink: Box<dyn WireSink>, connection: WeakConnection) -> Self {
        Self {
            slots: Vec::new(),
            sink,
            next_id: 1,
            open: true,
            target: None,
            connection,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|slot| !slot.removed)
            .map(|slot| slot.name.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .iter()
            .any(|slot| !slot.removed && slot.name == name)
    }

    pub fn contains_stage(&self, id: StageId) -> bool {
        self.slots.iter().any(|slot| !slot.removed && slot.id == id)
    }

    fn index_of(&self, id: StageId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    pub fn fire_connected(&mut self, target: Target) -> io::Result<()> {
        self.target = Some(target.clone());
        self.inbound_at(0, Event::Connected(target))
    }

    pub fn fire_read(&mut self, data: Bytes) -> io::Result<()> {
        self.inbound_at(0, Event::Read(data))
    }

    pub fn fire_error(&mut self, error: io::Error) -> io::Result<()> {
        self.inbound_at(0, Event::Error(error))
    }

    /// The transport went away underneath the pipeline.
    pub fn fire_closed(&mut self) -> io::Result<()> {
        self.mark_closed()
    }

    /// Writes from the end of the pipeline, through every stage.
    pub fn write(&mut self, data: Bytes) -> io::Result<()> {
        let end = self.slots.len();
        self.outbound_below(end, Event::Write(data))
    }

    pub fn close(&mut self) -> io::Result<()> {
        let end = self.slots.len();
        self.outbound_below(end, Event::Close)
    }

    /// Writes starting below the given stage, skipping it and everything after it.
    pub fn write_from(&mut self, id: StageId, data: Bytes) -> io::Result<()> {
        let index = self
            .index_of(id)
            .filter(|&i| !self.slots[i].removed)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("No stage with id {id:?}"))
            })?;
        self.outbound_below(index, Event::Write(data))
    }

    pub fn append(&mut self, name: impl Into<String>, stage: Box<dyn Stage>) -> io::Result<StageId> {
        let index = self.slots.len();
        self.insert_at(index, name.into(), stage)
    }

    pub fn insert_first(
        &mut self,
        name: impl Into<String>,
        stage: Box<dyn Stage>,
    ) -> io::Result<StageId> {
        self.insert_at(0, name.into(), stage)
    }

    /// Appends every stage of the chain, keeping its order.
    pub fn append_chain(&mut self, chain: StageChain) -> io::Result<()> {
        for (name, stage) in chain.stages {
            self.append(name, stage)?;
        }
        Ok(())
    }

    fn insert_at(&mut self, index: usize, name: String, stage: Box<dyn Stage>) -> io::Result<StageId> {
        if self.contains(&name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Duplicate stage name: {name}"),
            ));
        }

        let id = StageId(self.next_id);
        self.next_id += 1;

        self.slots.insert(
            index,
            Slot {
                id,
                name,
                stage: None,
                deferred: VecDeque::new(),
                removed: false,
            },
        );

        if let Err(e) = self.run(id, stage, Invocation::Added) {
            if let Some(index) = self.index_of(id) {
                let slot = self.slots.remove(index);
                if let Some(mut stage) = slot.stage {
                    stage.on_removed();
                }
            }
            return Err(e);
        }

        Ok(id)
    }

    fn inbound_at(&mut self, start: usize, event: Event) -> io::Result<()> {
        match (start..self.slots.len()).find(|&i| !self.slots[i].removed) {
            Some(index) => self.deliver(index, event),
            None => self.inbound_tail(event),
        }
    }

    fn outbound_below(&mut self, end: usize, event: Event) -> io::Result<()> {
        let end = end.min(self.slots.len());
        match (0..end).rev().find(|&i| !self.slots[i].removed) {
            Some(index) => self.deliver(index, event),
            None => self.outbound_head(event),
        }
    }

    fn inbound_tail(&mut self, event: Event) -> io::Result<()> {
        match event {
            Event::Error(e) => Err(e),
            Event::Read(data) => {
                log::trace!("Dropping {} bytes at the end of the pipeline", data.len());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn outbound_head(&mut self, event: Event) -> io::Result<()> {
        match event {
            Event::Write(data) => {
                if !self.open {
                    log::trace!("Dropping {} byte write on closed connection", data.len());
                    return Ok(());
                }
                self.sink.send(data)
            }
            Event::Close => self.mark_closed(),
            _ => Ok(()),
        }
    }

    fn mark_closed(&mut self) -> io::Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.sink.close();
        self.inbound_at(0, Event::Closed)
    }

    fn deliver(&mut self, index: usize, event: Event) -> io::Result<()> {
        let slot = &mut self.slots[index];
        match slot.stage.take() {
            Some(stage) => {
                let id = slot.id;
                self.run(id, stage, Invocation::Event(event))
            }
            None => {
                slot.deferred.push_back(event);
                Ok(())
            }
        }
    }

    /// Runs one invocation on a detached stage, then drains whatever reached
    /// it in the meantime, then reattaches it or finishes its removal.
    fn run(&mut self, id: StageId, mut stage: Box<dyn Stage>, first: Invocation) -> io::Result<()> {
        let mut result = self.invoke(id, stage.as_mut(), first);

        loop {
            let Some(index) = self.index_of(id) else {
                break;
            };
            let slot = &mut self.slots[index];
            if slot.removed {
                break;
            }
            let Some(event) = slot.deferred.pop_front() else {
                break;
            };
            let next = self.invoke(id, stage.as_mut(), Invocation::Event(event));
            if result.is_ok() {
                result = next;
            }
        }

        let Some(index) = self.index_of(id) else {
            stage.on_removed();
            return result;
        };

        if !self.slots[index].removed {
            self.slots[index].stage = Some(stage);
            return result;
        }

        let slot = self.slots.remove(index);
        stage.on_removed();
        for event in slot.deferred {
            let next = if event.is_inbound() {
                self.inbound_at(index, event)
            } else {
                self.outbound_below(index, event)
            };
            if result.is_ok() {
                result = next;
            }
        }
        result
    }

    fn invoke(&mut self, id: StageId, stage: &mut dyn Stage, invocation: Invocation) -> io::Result<()> {
        let mut ctx = StageContext { pipeline: self, id };
        match invocation {
            Invocation::Added => stage.on_added(&mut ctx),
            Invocation::Event(Event::Connected(target)) => stage.on_connected(&mut ctx, target),
            Invocation::Event(Event::Read(data)) => stage.on_read(&mut ctx, data),
            Invocation::Event(Event::Error(error)) => stage.on_error(&mut ctx, error),
            Invocation::Event(Event::Closed) => stage.on_closed(&mut ctx),
            Invocation::Event(Event::Write(data)) => stage.on_write(&mut ctx, data),
            Invocation::Event(Event::Close) => stage.on_close(&mut ctx),
        }
    }
}

/// A stage's handle on its pipeline while one of its callbacks runs.
pub struct StageContext<'a> {
    pipeline: &'a mut Pipeline,
    id: StageId,
}

impl StageContext<'_> {
    pub fn stage_id(&self) -> StageId {
        self.id
    }

    pub fn target(&self) -> Option<&Target> {
        self.pipeline.target()
    }

    pub fn is_open(&self) -> bool {
        self.pipeline.is_open()
    }

    pub fn connection(&self) -> WeakConnection {
        self.pipeline.connection.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipeline.contains(name)
    }

    fn own_index(&self) -> usize {
        self.pipeline.index_of(self.id).unwrap_or(0)
    }

    fn next_index(&self) -> usize {
        self.pipeline
            .index_of(self.id)
            .map_or(self.pipeline.slots.len(), |i| i + 1)
    }

    pub fn fire_connected(&mut self, target: Target) -> io::Result<()> {
        let start = self.next_index();
        self.pipeline.inbound_at(start, Event::Connected(target))
    }

    pub fn fire_read(&mut self, data: Bytes) -> io::Result<()> {
        let start = self.next_index();
        self.pipeline.inbound_at(start, Event::Read(data))
    }

    pub fn fire_error(&mut self, error: io::Error) -> io::Result<()> {
        let start = self.next_index();
        self.pipeline.inbound_at(start, Event::Error(error))
    }

    pub fn fire_closed(&mut self) -> io::Result<()> {
        let start = self.next_index();
        self.pipeline.inbound_at(start, Event::Closed)
    }

    pub fn write(&mut self, data: Bytes) -> io::Result<()> {
        let end = self.own_index();
        self.pipeline.outbound_below(end, Event::Write(data))
    }

    pub fn close(&mut self) -> io::Result<()> {
        let end = self.own_index();
        self.pipeline.outbound_below(end, Event::Close)
    }

    /// Inserts at the wire side of the pipeline.
    pub fn insert_first(
        &mut self,
        name: impl Into<String>,
        stage: Box<dyn Stage>,
    ) -> io::Result<StageId> {
        self.pipeline.insert_first(name, stage)
    }

    pub fn insert_before_self(
        &mut self,
        name: impl Into<String>,
        stage: Box<dyn Stage>,
    ) -> io::Result<StageId> {
        let index = self.own_index();
        self.pipeline.insert_at(index, name.into(), stage)
    }

    pub fn append(&mut self, name: impl Into<String>, stage: Box<dyn Stage>) -> io::Result<StageId> {
        self.pipeline.append(name, stage)
    }

    pub fn append_chain(&mut self, chain: StageChain) -> io::Result<()> {
        self.pipeline.append_chain(chain)
    }

    /// Takes this stage out of the pipeline once the running callback returns.
    /// Events that were queued for it continue past its position.
    pub fn remove_self(&mut self) {
        if let Some(index) = self.pipeline.index_of(self.id) {
            self.pipeline.slots[index].removed = true;
        }
    }
}

/// What a [`MemorySink`] has seen so far.
#[derive(Debug, Default)]
pub struct SinkRecord {
    pub written: Vec<Bytes>,
    pub closed: bool,
}

/// Sink that keeps everything in memory, for hosts that move bytes themselves.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    record: Arc<Mutex<SinkRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.record.lock().written.clone()
    }

    /// Everything written so far, concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.record
            .lock()
            .written
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.record.lock().written)
    }

    pub fn is_closed(&self) -> bool {
        self.record.lock().closed
    }
}

impl WireSink for MemorySink {
    fn send(&mut self, data: Bytes) -> io::Result<()> {
        let mut record = self.record.lock();
        if record.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to closed memory sink",
            ));
        }
        record.written.push(data);
        Ok(())
    }

    fn close(&mut self) {
        self.record.lock().closed = true;
    }
}
