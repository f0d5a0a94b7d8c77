// Context switch plumbing for C1 (the Coroutine primitive).
//
// Grounded on the teacher's `src/context.rs` (the `Context`/`Registers`
// split, and the `rust_swap_registers` FFI boundary linked from a
// build.rs-compiled static lib) but rewritten for stable Rust: the
// teacher's code is 2015-era nightly (`box` syntax, `#[feature(asm)]`,
// `std::simd`, multi-arch `Registers`). This crate targets exactly the
// one platform SPEC_FULL.md scopes it to (Linux/x86_64), so the
// register set collapses to the seven callee-saved GPRs System V
// requires a context switch to preserve.

use crate::stack::Stack;

#[repr(C)]
#[derive(Debug)]
struct Registers {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
}

impl Registers {
    fn new() -> Registers {
        Registers {
            rsp: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
        }
    }
}

extern "C" {
    fn swap_context(out_regs: *mut Registers, in_regs: *const Registers);
    fn coro_trampoline_bootstrap();
}

/// A saved machine context: enough to resume execution where it left
/// off (instruction pointer, stack pointer, callee-saved registers).
/// Mirrors `original_source/include/fiber.h`'s `ucontext_t m_ctx`
/// member at a lower level of abstraction.
#[derive(Debug)]
pub struct Context {
    regs: Box<Registers>,
}

/// First argument is the trampoline's context-carrying pointer (opaque
/// to this module -- coroutine.rs defines what it actually points to).
pub type EntryFn = extern "C" fn(*mut u8) -> !;

impl Context {
    /// An empty context, suitable only as the `out` side of a swap
    /// (e.g. a thread's master context before its first coroutine
    /// swap-in) or as scratch space that is immediately overwritten.
    pub fn empty() -> Context {
        Context {
            regs: Box::new(Registers::new()),
        }
    }

    /// Build a context that, when swapped into, starts executing
    /// `entry(arg)` on top of `stack`. `entry` must never return --
    /// the coroutine trampoline in coroutine.rs enforces this with an
    /// assertion after its own call into user code.
    pub fn new(entry: EntryFn, arg: *mut u8, stack: &Stack) -> Context {
        let mut regs = Box::new(Registers::new());

        // `swap_context` never reads or writes the r15/r14/r13/r12/rbx/rbp
        // fields of `Registers` -- it only stores/loads `rsp` through the
        // struct (switch.S's two `movq ..., (%rdi)`/`(%rsi)`), and instead
        // pushes/pops the actual registers on whatever stack `rsp` points
        // at. So this synthetic first frame has to lay those six slots out
        // on the coroutine's own stack, in the exact order `popq` walks
        // them (r15, r14, r13, r12, rbx, rbp), followed by the return
        // address `ret` consumes last.
        //
        // The return-address slot must sit on a 16-byte boundary: SysV
        // requires `rsp + 8` to be 16-byte aligned at a function's entry
        // point, and `ret` advances rsp by 8 past that slot when it jumps
        // into `coro_trampoline_bootstrap`.
        let sp = stack.top() as *mut u64;
        let frame = align_down_16(sp);
        let initial_rsp = unsafe { frame.offset(-6) };

        unsafe {
            *frame = coro_trampoline_bootstrap as usize as u64;
            // Slots 2 and 3 are where `popq %r13`/`popq %r12` land --
            // `coro_trampoline_bootstrap` reads the entry fn out of r13
            // and the trampoline arg out of r12 before jumping, so those
            // are the values that belong here, not the (unread) struct
            // fields of the same name.
            *initial_rsp.add(2) = entry as usize as u64;
            *initial_rsp.add(3) = arg as u64;
            // Slots 0, 1, 4, 5 (r15, r14, rbx, rbp) are popped as scratch
            // callee-saved values on the first swap-in; their value
            // doesn't matter since coro_trampoline_bootstrap only reads
            // r12/r13 before jumping, and fresh `mmap` pages read as zero.
        }
        regs.rsp = initial_rsp as u64;

        Context { regs }
    }

    /// Suspend `out`'s caller, saving its registers into `out`, and
    /// resume `in_ctx`. Returns once some later swap targets `out`
    /// again.
    pub fn swap(out: &mut Context, in_ctx: &Context) {
        trace!("context swap");
        unsafe {
            swap_context(&mut *out.regs as *mut Registers, &*in_ctx.regs as *const Registers);
        }
    }
}

fn align_down_16(sp: *mut u64) -> *mut u64 {
    let addr = sp as usize & !0xf;
    addr as *mut u64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stack::Stack;
    use std::cell::Cell;
    use std::ptr;

    thread_local! {
        static SWITCHED: Cell<bool> = Cell::new(false);
    }

    extern "C" fn entry(arg: *mut u8) -> ! {
        let caller: &Context = unsafe { &*(arg as *const Context) };
        SWITCHED.with(|s| s.set(true));
        let mut dummy = Context::empty();
        Context::swap(&mut dummy, caller);
        unreachable!("a coroutine context must never be resumed after returning");
    }

    #[test]
    fn swap_runs_entry_and_returns() {
        let mut cur = Context::empty();
        let stack = Stack::new(64 * 1024);
        let ctx = Context::new(entry, &mut cur as *mut Context as *mut u8, &stack);

        SWITCHED.with(|s| assert!(!s.get()));
        Context::swap(&mut cur, &ctx);
        SWITCHED.with(|s| assert!(s.get()));
        let _ = ptr::addr_of!(stack);
    }
}
