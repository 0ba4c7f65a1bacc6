// Command records and the bounded MPSC queue feeding the dispatcher
//
// Records own their payloads: the facade copies caller data at enqueue time,
// so a record never points into producer storage and enqueue can return
// before the dispatcher runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

use crate::constants::SEED_POINT_COUNT;
use crate::types::{TrackHeader, TrackPoint};

/// Producer-visible enqueue failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The queue is at capacity; operator commands surface this as
    /// backpressure instead of blocking.
    #[error("command queue is full")]
    QueueFull,
    /// Enqueue after shutdown was requested.
    #[error("service is shutting down")]
    ShutdownInProgress,
}

/// One command record. Payloads are owned copies.
#[derive(Debug, Clone)]
pub enum Command {
    /// Forward raw detection points to the visualizer; no store mutation.
    DrawPoints(Vec<TrackPoint>),
    /// Operator-judged fusion of two tracks.
    Merge { source: u32, target: u32 },
    /// Seed groups for new tracks, four points each.
    CreateTracks(Vec<[TrackPoint; SEED_POINT_COUNT]>),
    /// Filter output: (header hint carrying a previously observed id, point).
    AddPoints(Vec<(TrackHeader, TrackPoint)>),
    /// Reset the whole store.
    ClearAll,
}

/// Discriminant of a [`Command`], in a form the queue can index by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    DrawPoints,
    Merge,
    CreateTracks,
    AddPoints,
    ClearAll,
}

/// Dispatcher processing order, highest priority first. Operator feedback
/// (DrawPoints) must never stall behind bulk updates; ClearAll runs last so
/// a sweep's other work lands on the state the producers saw.
pub const PRIORITY_ORDER: [CommandKind; 5] = [
    CommandKind::DrawPoints,
    CommandKind::Merge,
    CommandKind::CreateTracks,
    CommandKind::AddPoints,
    CommandKind::ClearAll,
];

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::DrawPoints(_) => CommandKind::DrawPoints,
            Command::Merge { .. } => CommandKind::Merge,
            Command::CreateTracks(_) => CommandKind::CreateTracks,
            Command::AddPoints(_) => CommandKind::AddPoints,
            Command::ClearAll => CommandKind::ClearAll,
        }
    }
}

fn kind_index(kind: CommandKind) -> usize {
    match kind {
        CommandKind::DrawPoints => 0,
        CommandKind::Merge => 1,
        CommandKind::CreateTracks => 2,
        CommandKind::AddPoints => 3,
        CommandKind::ClearAll => 4,
    }
}

struct Inner {
    /// One FIFO per kind; cross-kind order is the dispatcher's business.
    queues: [VecDeque<Command>; 5],
    /// Total records across all kinds, bounded by `capacity`.
    len: usize,
    closed: bool,
}

/// Bounded multi-producer single-consumer command queue.
///
/// `try_enqueue` rejects at capacity (operator backpressure); `enqueue`
/// waits for space (pipeline flow control). Only the dispatcher drains.
pub struct CommandQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Consumer wakeup: a permit is stored on enqueue, so the dispatcher's
    /// bounded idle wait never misses a record.
    ready: Notify,
    /// Producer wakeup after a drain frees space. Signalled with
    /// `notify_one` so the permit is stored even when no producer has
    /// registered yet; woken producers pass the baton on close.
    space: Notify,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be nonzero");
        CommandQueue {
            inner: Mutex::new(Inner {
                queues: Default::default(),
                len: 0,
                closed: false,
            }),
            capacity,
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Append without waiting. Fails with `QueueFull` at capacity and
    /// `ShutdownInProgress` after `close`.
    pub fn try_enqueue(&self, cmd: Command) -> Result<(), ServiceError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(ServiceError::ShutdownInProgress);
            }
            if inner.len >= self.capacity {
                return Err(ServiceError::QueueFull);
            }
            let index = kind_index(cmd.kind());
            inner.queues[index].push_back(cmd);
            inner.len += 1;
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Append, waiting for space when the queue is at capacity. Fails only
    /// with `ShutdownInProgress`.
    pub async fn enqueue(&self, cmd: Command) -> Result<(), ServiceError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    drop(inner);
                    // Wake the next parked producer so close reaches everyone
                    self.space.notify_one();
                    return Err(ServiceError::ShutdownInProgress);
                }
                if inner.len < self.capacity {
                    let index = kind_index(cmd.kind());
                    inner.queues[index].push_back(cmd);
                    inner.len += 1;
                    drop(inner);
                    self.ready.notify_one();
                    return Ok(());
                }
            }
            // A drain or close between the check above and this await leaves
            // a stored permit, so the wakeup cannot be missed.
            self.space.notified().await;
        }
    }

    /// Remove and return every pending record of `kind`, preserving enqueue
    /// order. Dispatcher-only.
    pub fn drain_kind(&self, kind: CommandKind) -> Vec<Command> {
        let drained: Vec<Command> = {
            let mut inner = self.inner.lock().unwrap();
            let queue = std::mem::take(&mut inner.queues[kind_index(kind)]);
            inner.len -= queue.len();
            queue.into()
        };
        if !drained.is_empty() {
            self.space.notify_one();
        }
        drained
    }

    /// Total pending records across kinds.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until a record has been enqueued since the last drain, or the
    /// timeout elapses. Used for the dispatcher's bounded idle wait.
    pub async fn ready_timeout(&self, timeout: std::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.ready.notified()).await;
    }

    /// Reject all future enqueues and wake waiting producers. Each woken
    /// producer observes the closed flag and wakes the next one.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.space.notify_one();
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}
