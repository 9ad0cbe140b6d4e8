//! Operation API: the request object handed to [`crate::Blockstore::enqueue`]
//! and returned through its callback.

use crate::types::{ObjVer, Oid};
use std::fmt;

/// Operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Read,
    Write,
    Delete,
    Sync,
    Stable,
    Rollback,
}

impl OpCode {
    pub fn is_read(self) -> bool {
        matches!(self, OpCode::Read)
    }

    pub fn is_write(self) -> bool {
        matches!(self, OpCode::Write | OpCode::Delete)
    }
}

/// Callback invoked exactly once when the operation retires.
pub type OpCallback = Box<dyn FnOnce(&mut Op)>;

/// A storage operation.
///
/// `retval` carries the result: `len` for successful reads/writes, 0 for
/// sync/stable, or a negative errno. The buffer stays caller-owned in the
/// sense of the API contract: it is moved in here and handed back through
/// the callback.
pub struct Op {
    pub opcode: OpCode,
    pub oid: Oid,
    /// Write: 0 on admission, filled in by the engine.
    /// Read: 0 reads the newest visible version; otherwise the newest
    /// version not above this one is served and reported back here.
    pub version: u64,
    pub offset: u32,
    pub len: u32,
    /// Write payload or read destination
    pub buf: Vec<u8>,
    /// Stable/rollback target versions
    pub tuples: Vec<ObjVer>,
    pub retval: i64,
    pub(crate) callback: Option<OpCallback>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("opcode", &self.opcode)
            .field("oid", &self.oid)
            .field("version", &self.version)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("retval", &self.retval)
            .finish()
    }
}

impl Op {
    fn new(opcode: OpCode, oid: Oid) -> Self {
        Self {
            opcode,
            oid,
            version: 0,
            offset: 0,
            len: 0,
            buf: Vec::new(),
            tuples: Vec::new(),
            retval: 0,
            callback: None,
        }
    }

    pub fn read(oid: Oid, offset: u32, len: u32) -> Self {
        let mut op = Self::new(OpCode::Read, oid);
        op.offset = offset;
        op.len = len;
        op.buf = vec![0u8; len as usize];
        op
    }

    pub fn write(oid: Oid, offset: u32, buf: Vec<u8>) -> Self {
        let mut op = Self::new(OpCode::Write, oid);
        op.offset = offset;
        op.len = buf.len() as u32;
        op.buf = buf;
        op
    }

    pub fn delete(oid: Oid) -> Self {
        Self::new(OpCode::Delete, oid)
    }

    pub fn sync() -> Self {
        Self::new(OpCode::Sync, Oid::default())
    }

    pub fn stable(tuples: Vec<ObjVer>) -> Self {
        let mut op = Self::new(OpCode::Stable, Oid::default());
        op.tuples = tuples;
        op
    }

    pub fn rollback(tuples: Vec<ObjVer>) -> Self {
        let mut op = Self::new(OpCode::Rollback, Oid::default());
        op.tuples = tuples;
        op
    }

    /// Attach the completion callback.
    pub fn with_callback(mut self, cb: impl FnOnce(&mut Op) + 'static) -> Self {
        self.callback = Some(Box::new(cb));
        self
    }

    pub(crate) fn finish(&mut self) {
        if let Some(cb) = self.callback.take() {
            cb(self);
        }
    }
}
