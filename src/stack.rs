// Coroutine stacks: mmap-backed, guard-paged, with a small per-thread
// reuse pool for the common case of same-sized stacks being
// spawned/retired in a loop.
//
// Grounded on the teacher's `src/stack/stack_standard.rs` (size
// rounding, start/end/min_size accessors) and `stack_protected.rs`
// (guard page via mprotect, named there for unix/windows; this crate
// is unix/Linux-only so that split collapses into one file) plus
// `stack_pool.rs` (the reuse pool, `put`/`take_stack` behaviour kept,
// rewritten against the pool's actual element type). The teacher
// allocates with the `alloc` crate's raw heap allocator; we allocate
// with `mmap` (via `libc`) instead, to land an actual guard page --
// the teacher's own `stack_protected.rs` does the same via `mmap` +
// `mprotect`, so this is already the teacher's idiom for the
// guarded case, just made the only case.

use std::io;
use std::ptr;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::error::{Result, RuntimeError};

/// A coroutine's stack: one guard page (PROT_NONE) followed by the
/// usable region. `top()` is the highest usable address (the initial
/// stack pointer, since the stack grows down); `bottom()` is the
/// address of the guard page.
pub struct Stack {
    mapping: *mut libc::c_void,
    mapping_len: usize,
    usable_len: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a new stack able to hold at least `min_size` bytes of
    /// usable space, rounded up to a whole number of pages plus one
    /// extra guard page.
    pub fn new(min_size: usize) -> Stack {
        Stack::try_new(min_size).expect("failed to allocate coroutine stack")
    }

    pub fn try_new(min_size: usize) -> Result<Stack> {
        let page_size = page_size();
        let usable_len = round_up(min_size.max(page_size), page_size);
        let mapping_len = usable_len + page_size;

        unsafe {
            let mapping = libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(RuntimeError::SysCallError(io::Error::last_os_error()));
            }

            // Guard page stays PROT_NONE; the rest becomes read/write.
            let usable = (mapping as usize + page_size) as *mut libc::c_void;
            if libc::mprotect(usable, usable_len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(mapping, mapping_len);
                return Err(RuntimeError::SysCallError(err));
            }

            Ok(Stack {
                mapping,
                mapping_len,
                usable_len,
            })
        }
    }

    /// Address of the lowest usable byte (just above the guard page).
    pub fn bottom(&self) -> *const u8 {
        unsafe { (self.mapping as *const u8).add(self.guard_len()) }
    }

    /// One-past-the-end address of the usable region: the initial
    /// stack pointer handed to `Context::new`.
    pub fn top(&self) -> *const u8 {
        unsafe { self.bottom().add(self.usable_len) }
    }

    pub fn min_size(&self) -> usize {
        self.usable_len
    }

    fn guard_len(&self) -> usize {
        self.mapping_len - self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapping, self.mapping_len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("min_size", &self.usable_len)
            .finish()
    }
}

fn page_size() -> usize {
    static PAGE_SIZE: Lazy<usize> = Lazy::new(|| unsafe {
        let sz = libc::sysconf(libc::_SC_PAGESIZE);
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    });
    *PAGE_SIZE
}

fn round_up(from: usize, to: usize) -> usize {
    if from % to == 0 {
        from
    } else {
        from + to - (from % to)
    }
}

/// A small reuse pool keyed loosely by size: `put` pushes a retired
/// stack, `take` pops one at least as large as requested. Avoids a
/// mmap/mprotect/munmap round trip for workloads that spawn and
/// retire many same-sized coroutines (the scheduler's per-task
/// callback-wrapper coroutines, in particular).
pub struct StackPool {
    stacks: Mutex<Vec<Stack>>,
}

impl StackPool {
    pub fn new() -> StackPool {
        StackPool {
            stacks: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self, min_size: usize) -> Stack {
        let mut stacks = self.stacks.lock().unwrap();
        if let Some(pos) = stacks.iter().position(|s| s.min_size() >= min_size) {
            stacks.swap_remove(pos)
        } else {
            drop(stacks);
            Stack::new(min_size)
        }
    }

    pub fn put(&self, stack: Stack) {
        let mut stacks = self.stacks.lock().unwrap();
        if stacks.len() < 32 {
            stacks.push(stack);
        }
        // else: drop it, let munmap reclaim; unbounded pools are a slow leak.
    }
}

impl Default for StackPool {
    fn default() -> StackPool {
        StackPool::new()
    }
}

/// The process-wide pool `Coroutine::spawn`/its `Drop` draw from and
/// return to, so that a scheduler retiring one callback-wrapper
/// coroutine per task doesn't pay a fresh `mmap`/`mprotect` for the
/// next one.
static GLOBAL_POOL: Lazy<StackPool> = Lazy::new(StackPool::new);

pub fn take(min_size: usize) -> Stack {
    GLOBAL_POOL.take(min_size)
}

pub fn recycle(stack: Stack) {
    GLOBAL_POOL.put(stack)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stack_bounds_are_page_aligned_and_ordered() {
        let stack = Stack::new(37); // not a multiple of the page size
        assert!(stack.top() > stack.bottom());
        assert!(stack.min_size() >= 37);
        let page = page_size();
        assert_eq!(stack.min_size() % page, 0);
    }

    #[test]
    fn pool_reuses_a_released_stack() {
        let pool = StackPool::new();
        let s = pool.take(4096);
        let bottom = s.bottom();
        pool.put(s);
        let s2 = pool.take(4096);
        assert_eq!(s2.bottom(), bottom);
    }
}
