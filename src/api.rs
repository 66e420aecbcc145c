use crate::runtime::{self, HookRegistry};
use crate::version as version_info;
use std::ffi::{CString, c_char, c_void};

/// 一条 hook 请求。`hook_result` 由调用写回，表示本次实际影响的 slot 数。
#[derive(Clone, Debug)]
pub struct PltHookSpec {
    // 只 hook 当前绑定到该库的 slot；规则与库名相同
    pub callee: Option<String>,
    pub symbol: String,
    pub hook_fn: *mut c_void,
    pub no_chaining: bool,
    pub hook_result: usize,
}

impl PltHookSpec {
    pub fn new(symbol: impl Into<String>, hook_fn: *mut c_void) -> Self {
        Self {
            callee: None,
            symbol: symbol.into(),
            hook_fn,
            no_chaining: false,
            hook_result: 0,
        }
    }

    pub fn with_callee(mut self, callee: impl Into<String>) -> Self {
        self.callee = Some(callee.into());
        self
    }

    pub fn no_chaining(mut self) -> Self {
        self.no_chaining = true;
        self
    }
}

// 库过滤器，返回 true 表示在该库中处理该符号
pub type LibraryFilter = unsafe extern "C" fn(
    library_name: *const c_char,
    symbol: *const c_char,
    data: *mut c_void,
) -> bool;

// 路径或符号含 NUL 时无法交给 C 回调，直接跳过
fn call_filter(filter: LibraryFilter, library: &str, symbol: &str, data: *mut c_void) -> bool {
    let (Ok(library), Ok(symbol)) = (CString::new(library), CString::new(symbol)) else {
        return false;
    };
    unsafe { filter(library.as_ptr(), symbol.as_ptr(), data) }
}

fn single_spec(symbol: &str, hook_fn: *mut c_void) -> [PltHookSpec; 1] {
    [PltHookSpec::new(symbol, hook_fn)]
}

// 在指定库中 hook 单个符号，返回失败数
pub fn hook_plt_method(library: &str, symbol: &str, hook_fn: *mut c_void) -> usize {
    hook_single_lib(library, &mut single_spec(symbol, hook_fn))
}

pub fn unhook_plt_method(library: &str, symbol: &str, hook_fn: *mut c_void) -> usize {
    unhook_single_lib(library, &mut single_spec(symbol, hook_fn))
}

pub fn hook_single_lib(library: &str, specs: &mut [PltHookSpec]) -> usize {
    HookRegistry::global().hook_single_lib(library, specs)
}

pub fn unhook_single_lib(library: &str, specs: &mut [PltHookSpec]) -> usize {
    HookRegistry::global().unhook_single_lib(library, specs)
}

// filter 为 None 时处理所有已加载库
pub fn hook_all_libs(specs: &mut [PltHookSpec], filter: Option<LibraryFilter>, data: *mut c_void) -> usize {
    HookRegistry::global().hook_all_libs(specs, |library, symbol| {
        filter.is_none_or(|filter| call_filter(filter, library, symbol, data))
    })
}

pub fn unhook_all_libs(specs: &mut [PltHookSpec], filter: Option<LibraryFilter>, data: *mut c_void) -> usize {
    HookRegistry::global().unhook_all_libs(specs, |library, symbol| {
        filter.is_none_or(|filter| call_filter(filter, library, symbol, data))
    })
}

/// 在 hook 函数内获取链上的下一个函数（更早安装的 hook 或原函数）。
///
/// 必须在经由 trampoline 进入的调用中、以当前 hook 自身地址调用；
/// 否则进程会被终止。
pub fn get_prev_func(func: *mut c_void) -> *mut c_void {
    runtime::get_prev_func(func)
}

pub fn set_debug(debug: bool) {
    crate::log::set_debug_enabled(debug);
}

pub fn get_debug() -> bool {
    crate::log::debug_enabled()
}

pub fn get_version() -> String {
    version_info::version_str_full()
}

pub fn version() -> u32 {
    version_info::version()
}
