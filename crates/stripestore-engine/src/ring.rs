//! Async completion ring
//!
//! The engine talks to its devices exclusively through this ring: a fixed
//! capacity submission queue of tagged entries plus a completion queue
//! drained once per event-loop pass. `space_left()` is the backpressure
//! signal behind `WAIT_SQE`.
//!
//! Submissions are executed in order at [`Ring::submit`] and their
//! completions become visible on the following pass, which preserves the
//! submit-then-complete scheduling of a kernel completion ring while staying
//! deterministic and portable.

use crate::device::Device;
use bytes::Bytes;
use std::collections::VecDeque;
use std::rc::Rc;

/// Which device an entry targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDev {
    Data,
    Meta,
    Journal,
}

/// Completion routing tag. Completions are always dispatched on this tag,
/// never on the opcode of the operation that caused the submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// Sub-I/O of a client op; `sub` distinguishes fan-out reads
    Op { id: u64, sub: u32 },
    /// Journal sector close write, not owned by any op
    JournalSector { sector: usize },
    /// Journal start-block rewrite after a trim
    StartBlock,
    /// Sync barrier journal sector write
    SyncJournal { batch: u64 },
    /// Sync barrier fsync
    SyncFsync { batch: u64, dev: IoDev },
    /// Flusher job step
    Flusher { job: usize, sub: u32 },
    /// Recovery reads
    Init,
}

/// Submission payload.
pub enum SqeOp {
    Read { dev: IoDev, offset: u64, len: usize },
    Write { dev: IoDev, offset: u64, data: Bytes },
    Fsync { dev: IoDev },
}

pub struct Sqe {
    pub tag: Tag,
    pub op: SqeOp,
}

/// Completion entry: `res` is the transferred length or a negative errno;
/// reads carry their buffer.
pub struct Cqe {
    pub tag: Tag,
    pub res: i64,
    pub buf: Option<Vec<u8>>,
    pub was_write: bool,
}

/// The three device handles the ring executes against. Metadata and journal
/// may alias the data device.
pub struct DeviceSet {
    pub data: Rc<Device>,
    pub meta: Rc<Device>,
    pub journal: Rc<Device>,
}

impl DeviceSet {
    pub fn get(&self, dev: IoDev) -> &Device {
        match dev {
            IoDev::Data => &self.data,
            IoDev::Meta => &self.meta,
            IoDev::Journal => &self.journal,
        }
    }
}

pub struct Ring {
    capacity: usize,
    queued: Vec<Sqe>,
    completed: VecDeque<Cqe>,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queued: Vec::with_capacity(capacity),
            completed: VecDeque::new(),
        }
    }

    /// Free submission slots.
    pub fn space_left(&self) -> usize {
        self.capacity - self.queued.len()
    }

    /// Queue one entry. Callers must check `space_left()` first; pushing
    /// into a full queue is a logic error.
    pub fn push(&mut self, sqe: Sqe) {
        assert!(self.queued.len() < self.capacity, "submission queue overrun");
        self.queued.push(sqe);
    }

    /// Snapshot the submission position so a half-built batch can be
    /// abandoned when an op turns out not to be submittable.
    pub fn save(&self) -> usize {
        self.queued.len()
    }

    pub fn restore(&mut self, pos: usize) {
        self.queued.truncate(pos);
    }

    /// Execute all queued entries against the devices. Completions become
    /// visible to [`Self::drain`] afterwards.
    pub fn submit(&mut self, devs: &DeviceSet) -> usize {
        let n = self.queued.len();
        for sqe in self.queued.drain(..) {
            let cqe = match sqe.op {
                SqeOp::Read { dev, offset, len } => match devs.get(dev).read_at(offset, len) {
                    Ok(buf) => Cqe {
                        tag: sqe.tag,
                        res: len as i64,
                        buf: Some(buf),
                        was_write: false,
                    },
                    Err(e) => Cqe {
                        tag: sqe.tag,
                        res: -i64::from(e.raw_os_error().unwrap_or(libc::EIO)),
                        buf: None,
                        was_write: false,
                    },
                },
                SqeOp::Write { dev, offset, data } => {
                    match devs.get(dev).write_at(offset, &data) {
                        Ok(()) => Cqe {
                            tag: sqe.tag,
                            res: data.len() as i64,
                            buf: None,
                            was_write: true,
                        },
                        Err(e) => Cqe {
                            tag: sqe.tag,
                            res: -i64::from(e.raw_os_error().unwrap_or(libc::EIO)),
                            buf: None,
                            was_write: true,
                        },
                    }
                }
                SqeOp::Fsync { dev } => match devs.get(dev).fsync() {
                    Ok(()) => Cqe {
                        tag: sqe.tag,
                        res: 0,
                        buf: None,
                        was_write: true,
                    },
                    Err(e) => Cqe {
                        tag: sqe.tag,
                        res: -i64::from(e.raw_os_error().unwrap_or(libc::EIO)),
                        buf: None,
                        was_write: true,
                    },
                },
            };
            self.completed.push_back(cqe);
        }
        n
    }

    /// Take all pending completions, in delivery order.
    pub fn drain(&mut self) -> Vec<Cqe> {
        self.completed.drain(..).collect()
    }

    /// Put a completion back for the next drain (recovery-style immediate
    /// I/O must not swallow completions belonging to other consumers).
    pub fn requeue_completion(&mut self, cqe: Cqe) {
        self.completed.push_back(cqe);
    }

    pub fn has_completions(&self) -> bool {
        !self.completed.is_empty()
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }
}
