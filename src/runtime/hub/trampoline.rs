// Trampoline 代码生成与内存管理
// 汇编模板 + 运行时数据槽，每个 Hub 复制出一份独立的跳板代码
//
// 进入：保存全部参数寄存器 -> hub_enter(hub, 返回地址, 调用方栈指针) -> 恢复寄存器
// tracked=0 时直接尾跳到原函数；否则用 trampoline 自己的返回地址替换原返回地址，
// 栈上其余内容保持原样后调用链顶 hook，返回后 hub_exit 取回原返回地址再跳回调用方。
use crate::errno::Errno;
use crate::platform::memory;
use std::mem::size_of;
use std::ptr;

mod manager;

// 数据区：enter_fn, exit_fn, hub_ptr
const TRAMPO_DATA_WORDS: usize = 3;

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    r#"
    .text
    .balign 16
    .global plt_chain_trampo_template_start
    .global plt_chain_trampo_template_data
    .type plt_chain_trampo_template_start, %function
plt_chain_trampo_template_start:
    stp   x0, x1, [sp, #-0xd0]!
    stp   x2, x3, [sp, #0x10]
    stp   x4, x5, [sp, #0x20]
    stp   x6, x7, [sp, #0x30]
    stp   x8, lr, [sp, #0x40]
    stp   q0, q1, [sp, #0x50]
    stp   q2, q3, [sp, #0x70]
    stp   q4, q5, [sp, #0x90]
    stp   q6, q7, [sp, #0xb0]

    ldr   x0, .Lplt_chain_hub_ptr
    mov   x1, lr
    add   x2, sp, #0xd0
    ldr   x16, .Lplt_chain_enter_fn
    blr   x16
    mov   x17, x0
    mov   x16, x1

    ldp   q6, q7, [sp, #0xb0]
    ldp   q4, q5, [sp, #0x90]
    ldp   q2, q3, [sp, #0x70]
    ldp   q0, q1, [sp, #0x50]
    ldp   x8, lr, [sp, #0x40]
    ldp   x6, x7, [sp, #0x30]
    ldp   x4, x5, [sp, #0x20]
    ldp   x2, x3, [sp, #0x10]
    ldp   x0, x1, [sp], #0xd0
    cbz   x16, .Lplt_chain_bypass

    blr   x17

    stp   x0, x1, [sp, #-0x50]!
    stp   q0, q1, [sp, #0x10]
    stp   q2, q3, [sp, #0x30]
    ldr   x0, .Lplt_chain_hub_ptr
    add   x1, sp, #0x50
    ldr   x16, .Lplt_chain_exit_fn
    blr   x16
    mov   x30, x0
    ldp   q2, q3, [sp, #0x30]
    ldp   q0, q1, [sp, #0x10]
    ldp   x0, x1, [sp], #0x50
    ret

.Lplt_chain_bypass:
    br    x17

    .balign 8
plt_chain_trampo_template_data:
.Lplt_chain_enter_fn:
    .quad 0
.Lplt_chain_exit_fn:
    .quad 0
.Lplt_chain_hub_ptr:
    .quad 0
"#
);

// rsp+200 处是原返回地址；tracked 路径先弹掉它再 call，hook 看到的栈与原调用一致
// 只保存 xmm0-7 的低 128 位；以 __m256/__m512 按值传参的函数不支持 hook，hub_enter 内的代码可能改写 ymm/zmm 高位
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    r#"
    .text
    .balign 16
    .global plt_chain_trampo_template_start
    .global plt_chain_trampo_template_data
    .type plt_chain_trampo_template_start, @function
plt_chain_trampo_template_start:
    subq    $200, %rsp
    movdqu  %xmm0,    (%rsp)
    movdqu  %xmm1,  16(%rsp)
    movdqu  %xmm2,  32(%rsp)
    movdqu  %xmm3,  48(%rsp)
    movdqu  %xmm4,  64(%rsp)
    movdqu  %xmm5,  80(%rsp)
    movdqu  %xmm6,  96(%rsp)
    movdqu  %xmm7, 112(%rsp)
    movq    %rax,  128(%rsp)
    movq    %rdi,  136(%rsp)
    movq    %rsi,  144(%rsp)
    movq    %rdx,  152(%rsp)
    movq    %rcx,  160(%rsp)
    movq    %r8,   168(%rsp)
    movq    %r9,   176(%rsp)
    movq    %r10,  184(%rsp)

    movq    .Lplt_chain_hub_ptr(%rip), %rdi
    movq    200(%rsp), %rsi
    leaq    208(%rsp), %rdx
    call    *.Lplt_chain_enter_fn(%rip)
    movq    %rax, %r11
    testq   %rdx, %rdx

    movdqu     (%rsp), %xmm0
    movdqu   16(%rsp), %xmm1
    movdqu   32(%rsp), %xmm2
    movdqu   48(%rsp), %xmm3
    movdqu   64(%rsp), %xmm4
    movdqu   80(%rsp), %xmm5
    movdqu   96(%rsp), %xmm6
    movdqu  112(%rsp), %xmm7
    movq    128(%rsp), %rax
    movq    136(%rsp), %rdi
    movq    144(%rsp), %rsi
    movq    152(%rsp), %rdx
    movq    160(%rsp), %rcx
    movq    168(%rsp), %r8
    movq    176(%rsp), %r9
    movq    184(%rsp), %r10
    leaq    200(%rsp), %rsp
    jz      .Lplt_chain_bypass

    addq    $8, %rsp
    call    *%r11

    subq    $48, %rsp
    movq    %rax,    (%rsp)
    movq    %rdx,   8(%rsp)
    movdqu  %xmm0, 16(%rsp)
    movdqu  %xmm1, 32(%rsp)
    movq    .Lplt_chain_hub_ptr(%rip), %rdi
    leaq    48(%rsp), %rsi
    call    *.Lplt_chain_exit_fn(%rip)
    movq    %rax, %r11
    movq       (%rsp), %rax
    movq      8(%rsp), %rdx
    movdqu   16(%rsp), %xmm0
    movdqu   32(%rsp), %xmm1
    addq    $48, %rsp
    jmp     *%r11

.Lplt_chain_bypass:
    jmp     *%r11

    .balign 8
plt_chain_trampo_template_data:
.Lplt_chain_enter_fn:
    .quad 0
.Lplt_chain_exit_fn:
    .quad 0
.Lplt_chain_hub_ptr:
    .quad 0
"#,
    options(att_syntax)
);

unsafe extern "C" {
    static plt_chain_trampo_template_start: u8;
    static plt_chain_trampo_template_data: u8;
}

fn template_code_size() -> usize {
    let start = ptr::addr_of!(plt_chain_trampo_template_start) as usize;
    let data = ptr::addr_of!(plt_chain_trampo_template_data) as usize;
    data.saturating_sub(start)
}

pub(super) fn alloc_trampo() -> Result<usize, Errno> {
    manager::alloc_page()
}

pub(super) fn free_trampo(trampo: usize) {
    manager::free_page(trampo);
}

// 复制模板代码、填充数据槽、刷新 icache、切换为 RX
pub(super) unsafe fn init_trampo(
    trampo: usize,
    hub_ptr: usize,
    enter_fn: usize,
    exit_fn: usize,
) -> Result<(), Errno> {
    let code_size = template_code_size();
    let total = code_size + size_of::<usize>() * TRAMPO_DATA_WORDS;
    if code_size == 0 || total > memory::page_size() {
        return Err(Errno::NewTrampo);
    }

    let start = ptr::addr_of!(plt_chain_trampo_template_start);
    ptr::copy_nonoverlapping(start, trampo as *mut u8, code_size);
    let data_ptr = (trampo + code_size) as *mut usize;
    ptr::write(data_ptr, enter_fn);
    ptr::write(data_ptr.add(1), exit_fn);
    ptr::write(data_ptr.add(2), hub_ptr);

    memory::flush_instruction_cache_range(trampo, trampo + total);
    let execute_prot = memory::PROT_READ_FLAG | memory::PROT_EXEC_FLAG;
    memory::set_addr_protect(trampo, execute_prot).map_err(|_| Errno::NewTrampo)?;
    Ok(())
}
