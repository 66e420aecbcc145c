// libpeer.so：自带 clock 以及浮点、大结构体参数的导出函数，由 libpeer_client.so 经 GOT 调用
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

// 与 libc 的 clock 同名，但固定返回 1
#[unsafe(no_mangle)]
pub extern "C" fn clock() -> i64 {
    1
}

#[unsafe(no_mangle)]
pub extern "C" fn nice1(one: i32) -> f64 {
    -f64::from(one * one)
}

#[unsafe(no_mangle)]
pub extern "C" fn nice2(one: i32, two: f64) -> i32 {
    (f64::from(one) * two).round() as i32
}

#[unsafe(no_mangle)]
pub extern "C" fn large_scale(one: i32, two: i32, three: i32, mut value: Large, factor: f64) -> Large {
    value.a *= factor;
    value.b += one;
    value.c -= factor;
    value.e += i64::from(two);
    value.f -= i64::from(three);
    value.g ^= 0xff;
    value
}
