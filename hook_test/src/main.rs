#![allow(unsafe_op_in_unsafe_fn)]

mod scenarios;
mod test_ctx;

use plt_chain::{get_version, set_debug};

fn main() {
    set_debug(test_ctx::env_flag("HOOK_TEST_DEBUG"));
    println!("{}", get_version());
    unsafe {
        scenarios::run_all();
    }
    println!("hook_test all scenarios passed");
}
