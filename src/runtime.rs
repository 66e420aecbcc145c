// runtime 模块入口：hook 链、hub/trampoline 调度与 registry，统一暴露给 api 层
use std::ffi::c_void;

mod callback_ctx;
mod chain;
mod config;
mod hub;
mod installer;
mod libraries;
mod registry;
mod rules;
mod state;
mod thread_state;

pub use chain::SlotTarget;
pub use config::RegistryConfig;
pub use installer::{GotInstaller, SlotInstaller};
pub use registry::HookRegistry;

pub(crate) fn get_prev_func(func: *mut c_void) -> *mut c_void {
    hub::get_prev_func(func as usize) as *mut c_void
}
