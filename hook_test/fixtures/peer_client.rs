// libpeer_client.so：每个导出函数都经本库的 GOT 调用 libpeer.so
use std::ffi::c_char;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Large {
    pub a: f64,
    pub b: i32,
    pub c: f64,
    pub d: *const c_char,
    pub e: i64,
    pub f: i64,
    pub g: u8,
}

#[link(name = "peer")]
unsafe extern "C" {
    fn clock() -> i64;
    fn nice1(one: i32) -> f64;
    fn nice2(one: i32, two: f64) -> i32;
    fn large_scale(one: i32, two: i32, three: i32, value: Large, factor: f64) -> Large;
}

#[unsafe(no_mangle)]
pub extern "C" fn call_clock() -> i64 {
    unsafe { clock() }
}

#[unsafe(no_mangle)]
pub extern "C" fn call_nice1(one: i32) -> f64 {
    unsafe { nice1(one) }
}

#[unsafe(no_mangle)]
pub extern "C" fn call_nice2(one: i32, two: f64) -> i32 {
    unsafe { nice2(one, two) }
}

#[unsafe(no_mangle)]
pub extern "C" fn call_large_scale(one: i32, two: i32, three: i32, value: Large, factor: f64) -> Large {
    unsafe { large_scale(one, two, three, value, factor) }
}
