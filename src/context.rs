//! The per-frame execution state pushed and popped by `call`/`ret` and
//! `save`/`restore`.

use bitflags::bitflags;

bitflags! {
    /// Per-instruction status bits, cleared and set by `Logic`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        /// The last instruction changed `ip` directly; the driver must
        /// not also advance it.
        const WAS_JUMP   = 1 << 0;
        /// `quit` was executed; the driver unwinds one context (or
        /// stops, at the initial buffer).
        const EXIT       = 1 << 1;
        /// "No flag change": suppresses `Logic::analyze` after
        /// arithmetic instructions.
        const NFC        = 1 << 2;
        const ZERO       = 1 << 3;
        const NEGATIVE   = 1 << 4;
        const INVALID_FP = 1 << 5;
        /// The frame pointer captured at `save_context` no longer names
        /// a valid prefix of the frame stack (diagnostic only; the MMU
        /// still honors `verify_reference`'s bounds check regardless).
        const INVALID_FP_POINTER = 1 << 6;
    }
}

/// Sentinel meaning "no buffer currently selected".
pub const NO_BUFFER: usize = usize::MAX;

/// An execution frame: instruction pointer, per-instruction flags, the
/// `ContextBuffer` it runs against, call-stack depth, and the frame
/// pointer captured at the most recent `save_context`.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub ip: usize,
    pub flags: Flags,
    pub buffer: usize,
    pub depth: usize,
    pub frame_pointer: usize,
}

impl Context {
    pub fn new(buffer: usize) -> Self {
        Context {
            ip: 0,
            flags: Flags::empty(),
            buffer,
            depth: 0,
            frame_pointer: 0,
        }
    }

    pub fn empty() -> Self {
        Context::new(NO_BUFFER)
    }

    /// Zero `ip`/`flags`/`frame_pointer`/`depth`, keeping `buffer` —
    /// used by `Mmu::clear_context`.
    pub fn clear(&mut self) {
        self.ip = 0;
        self.flags = Flags::empty();
        self.frame_pointer = 0;
        self.depth = 0;
    }
}
