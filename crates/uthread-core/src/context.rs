//! Execution contexts.
//!
//! A [`Context`] is the TCB-owned record of where a thread left off. The
//! runtime keeps the actual stack alive; this value carries the metadata
//! the scheduler validates before handing the CPU back: the owner, a
//! capture generation, the capture kind and a guard word derived from
//! them. A switch to a context whose guard or owner does not match is
//! refused, which is how resuming a foreign, dead or corrupted context is
//! caught before any user code runs.
//!
//! Signal handlers run inside signal frames stacked on the context. Each
//! frame records the mask to restore when the handler returns or unwinds.

use crate::signal::{SigSet, Signal};
use crate::tcb::ThreadId;

const CONTEXT_MAGIC: u64 = 0x5554_4852_4541_4431; // "UTHREAD1"
const CONTEXT_GUARD_SALT: u64 = 0x9E37_79B9_7F4A_7C15;
const KIND_TAG_FRESH: u64 = 0x4652_4553_4800_0001;
const KIND_TAG_COOPERATIVE: u64 = 0x434f_4f50_0000_0002;
const KIND_TAG_INTERRUPTED: u64 = 0x494e_5452_0000_0003;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Never ran; resuming starts the entry function.
    Fresh,
    /// Left voluntarily (block or yield).
    Cooperative,
    /// Taken off the CPU at a safe point by slice expiry or priority.
    Interrupted,
}

fn kind_tag(kind: ContextKind) -> u64 {
    match kind {
        ContextKind::Fresh => KIND_TAG_FRESH,
        ContextKind::Cooperative => KIND_TAG_COOPERATIVE,
        ContextKind::Interrupted => KIND_TAG_INTERRUPTED,
    }
}

fn compute_guard(owner: u64, generation: u64, kind: ContextKind) -> u64 {
    owner.rotate_left(17).wrapping_add(generation.rotate_left(33))
        ^ kind_tag(kind).rotate_left(11)
        ^ CONTEXT_GUARD_SALT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    UninitializedContext,
    ForeignContext,
    CorruptedContext,
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ContextError::UninitializedContext => "context was never captured or has been retired",
            ContextError::ForeignContext => "context belongs to another thread",
            ContextError::CorruptedContext => "context guard mismatch",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ContextError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub generation: u64,
    pub kind: ContextKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame {
    pub signal: Signal,
    pub saved_mask: SigSet,
}

#[derive(Debug, Clone)]
pub struct Context {
    magic: u64,
    owner: u64,
    generation: u64,
    kind: ContextKind,
    guard: u64,
    frames: Vec<SignalFrame>,
}

impl Context {
    #[must_use]
    pub fn new(owner: ThreadId) -> Self {
        let owner = owner.as_u64();
        Self {
            magic: CONTEXT_MAGIC,
            owner,
            generation: 1,
            kind: ContextKind::Fresh,
            guard: compute_guard(owner, 1, ContextKind::Fresh),
            frames: Vec::new(),
        }
    }

    fn is_initialized(&self) -> bool {
        self.magic == CONTEXT_MAGIC && self.owner != 0 && self.generation != 0
    }

    /// Records that the owner is leaving the CPU.
    pub fn capture(&mut self, kind: ContextKind) -> Capture {
        self.generation = self.generation.wrapping_add(1).max(1);
        self.kind = kind;
        self.guard = compute_guard(self.owner, self.generation, kind);
        Capture {
            generation: self.generation,
            kind,
        }
    }

    /// Validates that `owner` may be resumed from this context.
    pub fn restore(&self, owner: ThreadId) -> Result<Capture, ContextError> {
        if !self.is_initialized() {
            return Err(ContextError::UninitializedContext);
        }
        if self.owner != owner.as_u64() {
            return Err(ContextError::ForeignContext);
        }
        if self.guard != compute_guard(self.owner, self.generation, self.kind) {
            return Err(ContextError::CorruptedContext);
        }
        Ok(Capture {
            generation: self.generation,
            kind: self.kind,
        })
    }

    /// Marks the context unusable once its thread is dead.
    pub fn retire(&mut self) {
        self.magic = 0;
        self.frames.clear();
    }

    #[must_use]
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn push_frame(&mut self, frame: SignalFrame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<SignalFrame> {
        self.frames.pop()
    }

    /// Number of handlers currently executing on this context.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_guard_for_tests(&mut self) {
        self.guard ^= 0xA5A5;
    }
}
