#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("plt_chain supports Linux and Android only");

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("plt_chain supports only 64-bit architectures: aarch64 and x86_64");

// 公共 API 层：批量 hook/unhook、call-previous、调试开关
mod api;
// ELF 解析：动态段、符号表、重定位表
mod elf;
// 错误码定义
mod errno;
// 日志输出，Android 写 logcat
mod log;
// 内存保护与指令缓存
mod platform;
// hook 链、trampoline 调度与 registry
mod runtime;
// 版本信息
mod version;

pub use api::{
    LibraryFilter, PltHookSpec, get_debug, get_prev_func, get_version, hook_all_libs,
    hook_plt_method, hook_single_lib, set_debug, unhook_all_libs, unhook_plt_method,
    unhook_single_lib, version,
};
pub use errno::Errno;
pub use errno::Errno as PltChainErrno;
pub use runtime::{GotInstaller, HookRegistry, RegistryConfig, SlotInstaller, SlotTarget};

/// 在 hook 函数内调用链上的下一个函数。
///
/// 第一个参数是当前 hook 函数本身，第二个参数是它的函数指针类型，其余为转发的实参。
/// 只能在经由 trampoline 进入的 hook 中使用。
#[macro_export]
macro_rules! call_prev {
    ($hook:path, $fn_ty:ty $(, $arg:expr)* $(,)?) => {{
        let prev = $crate::get_prev_func($hook as usize as *mut ::std::ffi::c_void);
        let prev: $fn_ty = unsafe { ::std::mem::transmute::<*mut ::std::ffi::c_void, $fn_ty>(prev) };
        unsafe { prev($($arg),*) }
    }};
}
