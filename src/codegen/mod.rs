//! The native x86-64 backend: compiles a `ContextBuffer`'s command
//! stream to machine code and runs it behind the fixed
//! `fn(out_tag: *mut u32) -> u64` calling contract, falling back to the
//! interpreter for anything it can't translate (see `compile`'s module
//! doc) or on a non-x86-64 host.

pub mod compile;
pub mod emit;

use std::collections::HashMap;

use log::{debug, warn};
use target_lexicon::{Architecture, HOST};

use crate::commandset::CommandSet;
use crate::error::{VmError, VmResult};
use crate::mmu::Mmu;
use crate::value::{Value, ValueType};

/// A compiled buffer: its executable bytes plus the live `mmap` region
/// once mapped RWX. `mapped` is `None` between `compile` and the first
/// `run` (or after `deallocate`).
pub struct NativeImage {
    bytes: Vec<u8>,
    mapped: Option<region::Allocation>,
}

impl NativeImage {
    fn entry(&self) -> VmResult<extern "C" fn(*mut u32) -> u64> {
        let region = self.mapped.as_ref().ok_or_else(|| {
            VmError::native("native image was compiled but never mapped executable")
        })?;
        let ptr = region.as_ptr::<u8>();
        // SAFETY: `bytes` was assembled by `compile::compile_buffer` to
        // the calling contract this transmute assumes, and `region` was
        // mapped with exec permission by `map_executable`.
        Ok(unsafe { std::mem::transmute::<*const u8, extern "C" fn(*mut u32) -> u64>(ptr) })
    }
}

/// Owns every buffer's compiled image, keyed by a checksum of its
/// command stream (see `logic::checksum_state`) so a buffer that
/// mutates invalidates its own cached image implicitly — any caller
/// that recompiles after a mutation simply gets a new map entry under
/// the new checksum; the stale one is dropped via `deallocate`.
pub struct Backend {
    images: HashMap<u64, NativeImage>,
    host_supported: bool,
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        let host_supported = matches!(HOST.architecture, Architecture::X86_64);
        if !host_supported {
            warn!("native backend disabled: host architecture is {:?}", HOST.architecture);
        }
        Backend {
            images: HashMap::new(),
            host_supported,
        }
    }

    pub fn host_supported(&self) -> bool {
        self.host_supported
    }

    pub fn image_is_ok(&self, checksum: u64) -> bool {
        self.images.contains_key(&checksum)
    }

    /// Compile the current buffer's command stream, map it executable,
    /// and cache it under `checksum`. A compile failure (unsupported
    /// opcode) is not fatal to the caller: it means this buffer should
    /// run interpreted instead.
    pub fn compile(&mut self, checksum: u64, mmu: &Mmu, command_set: &CommandSet) -> VmResult<()> {
        if !self.host_supported {
            return Err(VmError::native("native backend unavailable on this host"));
        }
        if self.images.contains_key(&checksum) {
            return Ok(());
        }
        let bytes = compile::compile_buffer(mmu, command_set)?;
        let mapped = map_executable(&bytes)?;
        debug!("compiled buffer checksum={checksum:#x} ({} bytes of code)", bytes.len());
        self.images.insert(
            checksum,
            NativeImage {
                bytes,
                mapped: Some(mapped),
            },
        );
        Ok(())
    }

    pub fn get_image(&self, checksum: u64) -> Option<&NativeImage> {
        self.images.get(&checksum)
    }

    /// Call into a cached image's entry point, returning the ABI-packed
    /// result value.
    pub fn run(&self, checksum: u64) -> VmResult<Value> {
        let image = self
            .images
            .get(&checksum)
            .ok_or_else(|| VmError::native("no compiled image for this checksum"))?;
        let entry = image.entry()?;
        let mut tag_out: u32 = ValueType::Uninitialised.as_u8() as u32;
        // SAFETY: `entry` honors the fixed calling contract: it reads no
        // register state but `out_tag` (passed in RDI) and returns the
        // ABI-packed value in RAX, per `compile::compile_buffer`'s
        // prologue/epilogue.
        let bits = entry(&mut tag_out as *mut u32);
        let tag = ValueType::from_u8(tag_out as u8)?;
        Ok(Value::set_from_abi(bits, tag))
    }

    pub fn deallocate(&mut self, checksum: u64) {
        self.images.remove(&checksum);
    }

    pub fn deallocate_all(&mut self) {
        self.images.clear();
    }
}

fn map_executable(code: &[u8]) -> VmResult<region::Allocation> {
    use region::{alloc, Protection};

    let mut mem = alloc(code.len().max(1), Protection::READ_WRITE)
        .map_err(|e| VmError::native(format!("region::alloc failed: {e}")))?;
    // SAFETY: `mem` is a freshly allocated, exclusively owned region at
    // least `code.len()` bytes long.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), mem.as_mut_ptr::<u8>(), code.len());
    }
    region::protect(mem.as_ptr::<u8>(), mem.len(), Protection::READ_EXECUTE)
        .map_err(|e| VmError::native(format!("region::protect failed: {e}")))?;
    Ok(mem)
}
