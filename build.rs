// Compiles the hand-written context-switch assembly and links it as a
// static library, the same division of labour as upstream coroutine-rs
// (gcc crate -> libctxswtch.a) with `cc` standing in for the abandoned
// `gcc` crate.

fn main() {
    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_arch != "x86_64" {
        panic!(
            "coroutine-rt's context switch is only implemented for x86_64 linux \
             (target_arch = {target_arch:?}); the reactor is epoll-specific and \
             Linux/x86_64-only by design, see SPEC_FULL.md section 1"
        );
    }

    cc::Build::new()
        .file("src/asm/x86_64/switch.S")
        .compile("ctxswitch");

    println!("cargo:rerun-if-changed=src/asm/x86_64/switch.S");
}
