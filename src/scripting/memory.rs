/// `scripting/memory.rs` — byte accounting for the interpreter heap
///
/// `AllocState` is the accounting record: net live bytes, the configured
/// budget, and two sticky failure flags the host can inspect after a run.
/// `limited_alloc` implements the interpreter-family allocator contract
/// `(ptr, curr_size, new_size)` against that record; the runtime mirrors
/// the embedded VM's own accounting into the same record and enforces the
/// budget through the binding's memory-limit facility.
use std::alloc::{self, Layout};
use std::ptr;

pub const ONE_MIB: usize = 1024 * 1024;
pub const DEFAULT_MEMORY_LIMIT: usize = ONE_MIB;

// What a C allocator guarantees for any object type.
const ALLOC_ALIGN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocState {
    /// Net bytes currently attributed to the interpreter heap.
    pub used: usize,
    /// Byte budget; `0` disables the limit.
    pub limit: usize,
    /// Set when an allocation was denied for exceeding `limit`.
    pub limit_reached: bool,
    /// Set when the accounting arithmetic would overflow `usize`.
    pub overflow: bool,
}

impl Default for AllocState {
    fn default() -> Self {
        Self {
            used: 0,
            limit: DEFAULT_MEMORY_LIMIT,
            limit_reached: false,
            overflow: false,
        }
    }
}

impl AllocState {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn is_limit_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Clears the failure flags without touching the byte account.
    pub fn reset_error_flags(&mut self) {
        self.limit_reached = false;
        self.overflow = false;
    }

    pub fn disable_limit(&mut self) {
        self.limit = 0;
    }
}

/// Allocator with the embedded-VM contract:
///
/// - a null `ptr` means a fresh allocation and forces `curr_size` to 0;
/// - `new_size == 0` frees `ptr` (when non-null), decrements `used` by at
///   most its current value, and returns null;
/// - otherwise the block is reallocated to `new_size`. The request is
///   denied, without touching memory, when the accounting would overflow
///   or when an enabled limit would be exceeded; `used` is updated only
///   when the underlying reallocation succeeds.
///
/// `used` never wraps: a `curr_size` larger than the account clamps the
/// subtraction to zero.
///
/// # Safety
///
/// `ptr` must be null or a block previously returned by this function with
/// `curr_size` equal to that block's size, as the VM allocator contract
/// guarantees.
pub unsafe fn limited_alloc(
    state: &mut AllocState,
    ptr: *mut u8,
    curr_size: usize,
    new_size: usize,
) -> *mut u8 {
    let curr_size = if ptr.is_null() { 0 } else { curr_size };

    if new_size == 0 {
        if !ptr.is_null() {
            state.used -= state.used.min(curr_size);
            if curr_size > 0 {
                if let Some(layout) = layout_for(curr_size) {
                    alloc::dealloc(ptr, layout);
                }
            }
        }
        return ptr::null_mut();
    }

    let used_base = if state.used >= curr_size {
        state.used - curr_size
    } else {
        0
    };

    if new_size > usize::MAX - used_base {
        log::error!(
            "Lua allocator: arithmetic overflow while computing memory usage \
             [used: {}, requested more for: {}, max size: {}]",
            used_base,
            new_size,
            usize::MAX
        );
        state.overflow = true;
        return ptr::null_mut();
    }
    let new_used = used_base + new_size;
    if state.is_limit_enabled() && new_used > state.limit {
        log::error!(
            "Lua allocator: memory limit reached [limit: {}, used: {}, requested total: {}]",
            state.limit,
            state.used,
            new_used
        );
        state.limit_reached = true;
        return ptr::null_mut();
    }

    let new_ptr = match layout_for(new_size) {
        Some(new_layout) => {
            if ptr.is_null() || curr_size == 0 {
                alloc::alloc(new_layout)
            } else {
                match layout_for(curr_size) {
                    Some(curr_layout) => alloc::realloc(ptr, curr_layout, new_size),
                    None => ptr::null_mut(),
                }
            }
        }
        None => ptr::null_mut(),
    };
    if !new_ptr.is_null() {
        state.used = new_used;
    }
    new_ptr
}

fn layout_for(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, ALLOC_ALIGN).ok()
}
