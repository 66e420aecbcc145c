// 分级日志：Android 写 logcat，其余平台写 stderr
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

pub const LOG_DEBUG: i32 = 3;
pub const LOG_INFO: i32 = 4;
pub const LOG_WARN: i32 = 5;
pub const LOG_ERROR: i32 = 6;

const LOG_TAG: &str = "plt_chain";

static LOG_PRIORITY: AtomicI32 = AtomicI32::new(LOG_WARN);

#[cfg(target_os = "android")]
#[link(name = "log")]
unsafe extern "C" {
    fn __android_log_write(prio: i32, tag: *const i8, text: *const i8) -> i32;
}

// 启用时输出 DEBUG 及以上，禁用时仅输出 WARN 及以上
pub fn set_debug_enabled(enabled: bool) {
    let priority = if enabled { LOG_DEBUG } else { LOG_WARN };
    LOG_PRIORITY.store(priority, Ordering::SeqCst);
}

pub fn debug_enabled() -> bool {
    LOG_PRIORITY.load(Ordering::Relaxed) <= LOG_DEBUG
}

fn enabled(priority: i32) -> bool {
    LOG_PRIORITY.load(Ordering::Relaxed) <= priority
}

#[cfg(target_os = "android")]
fn emit(priority: i32, args: fmt::Arguments) {
    let mut text = format!("{args}").into_bytes();
    for byte in &mut text {
        if *byte == 0 {
            *byte = b' ';
        }
    }
    text.push(0);
    let tag = std::ffi::CString::new(LOG_TAG).unwrap_or_default();
    unsafe {
        __android_log_write(priority, tag.as_ptr(), text.as_ptr() as *const i8);
    }
}

#[cfg(not(target_os = "android"))]
fn emit(priority: i32, args: fmt::Arguments) {
    use std::io::Write;

    let level = match priority {
        LOG_DEBUG => "D",
        LOG_INFO => "I",
        LOG_WARN => "W",
        _ => "E",
    };
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{level} {LOG_TAG}: {args}");
}

fn write_log(priority: i32, args: fmt::Arguments) {
    if !enabled(priority) {
        return;
    }
    emit(priority, args);
}

pub(crate) fn info(args: fmt::Arguments) {
    write_log(LOG_INFO, args);
}

pub(crate) fn debug(args: fmt::Arguments) {
    write_log(LOG_DEBUG, args);
}

pub(crate) fn warn(args: fmt::Arguments) {
    write_log(LOG_WARN, args);
}

pub(crate) fn error(args: fmt::Arguments) {
    write_log(LOG_ERROR, args);
}

// 不可恢复的使用错误：无视日志级别输出后直接 abort
pub(crate) fn fatal(args: fmt::Arguments) -> ! {
    emit(LOG_ERROR, format_args!("fatal: {args}"));
    std::process::abort()
}
