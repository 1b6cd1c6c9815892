//! Kernel-entry trampoline: the raw [`PhysWriter`] used while loading, and
//! the two-stage CR3 switch that actually hands control to the kernel.
//!
//! An `asm!` sequence (`mov cr3, {cr3}; jmp {entry}`) patched into a page
//! that both address spaces map identically, working for an arbitrary
//! kernel address space instead of one fixed PML4 slot. The extra
//! indirection through a patched code page exists
//! because the final `mov cr3` switches straight into the kernel's own
//! address space, which in general does not keep the loader's `.text`
//! mapped — only `trampoline_virt` is guaranteed mapped identically (same
//! physical page) on both sides of that switch, since `initium::loader::load`
//! installs that one mapping into both the kernel's `TrackedMmu` and the
//! throwaway trampoline one.

use alpheratz_core::initium::loader::PhysWriter;
use alpheratz_core::initium::tags::INITIUM_MAGIC;

/// Writes through the loader's own identity-mapped view of memory. Sound
/// before `exit_boot_services` because UEFI leaves all `Free`-typed RAM
/// identity mapped; nothing here calls into boot services itself.
pub struct DirectWriter;

impl PhysWriter for DirectWriter {
    fn write(&mut self, phys: u64, data: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), phys as *mut u8, data.len());
        }
    }
}

/// Encode the trampoline's machine code: load `cr3`, load the tag-list
/// pointer and magic into the registers the Initium ABI hands off in, then
/// jump to the kernel entry point. Three `movabs`-style 10-byte loads plus
/// a 3-byte `mov cr3` and a 2-byte `jmp rax`, comfortably inside one page.
///
/// ```text
/// 48 b8 <cr3>        mov rax, cr3_value
/// 0f 22 d8           mov cr3, rax
/// 48 bf <tags_virt>  mov rdi, tags_virt
/// 48 be <magic>      mov rsi, magic
/// 48 b8 <entry>      mov rax, entry
/// ff e0              jmp rax
/// ```
pub fn encode(kernel_mmu_root: u64, tags_virt: u64, entry: u64) -> alloc::vec::Vec<u8> {
    let mut code = alloc::vec::Vec::with_capacity(40);
    code.extend_from_slice(&[0x48, 0xb8]);
    code.extend_from_slice(&kernel_mmu_root.to_le_bytes());
    code.extend_from_slice(&[0x0f, 0x22, 0xd8]);
    code.extend_from_slice(&[0x48, 0xbf]);
    code.extend_from_slice(&tags_virt.to_le_bytes());
    code.extend_from_slice(&[0x48, 0xbe]);
    code.extend_from_slice(&(INITIUM_MAGIC as u64).to_le_bytes());
    code.extend_from_slice(&[0x48, 0xb8]);
    code.extend_from_slice(&entry.to_le_bytes());
    code.extend_from_slice(&[0xff, 0xe0]);
    code
}

/// Switch into the trampoline address space and jump to `trampoline_virt`.
/// Never returns: the patched page itself performs the second CR3 switch
/// into the kernel and the final jump to its entry point.
///
/// # Safety
/// `trampoline_root` must be a valid CR3 value for a page-table hierarchy
/// that maps `trampoline_virt` to the trampoline's physical page, which
/// must already hold bytes written by [`encode`]. Boot services must
/// already be exited; nothing returns from this function.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enter(trampoline_root: u64, trampoline_virt: u64) -> ! {
    unsafe {
        core::arch::asm!(
            "mov cr3, {root}",
            "jmp {target}",
            root = in(reg) trampoline_root,
            target = in(reg) trampoline_virt,
            options(noreturn),
        );
    }
}
