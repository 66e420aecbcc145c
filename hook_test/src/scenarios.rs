mod aggregate;
mod basic;
mod filters;
mod peer;
mod stress;

use crate::test_ctx::env_flag;

pub unsafe fn run_all() {
    run("chain", basic::scenario_chain_compose_unhook);
    run("reinstall", basic::scenario_reinstall_after_remove);
    run("no-chaining", basic::scenario_no_chaining_exclusive);
    run("redundant-unhook", basic::scenario_redundant_unhook);
    run("plt-method", basic::scenario_plt_method_wrappers);
    run("filter", filters::scenario_filter_selects_library);
    run("callee", filters::scenario_callee_qualified_spec);
    run("unhook-all", filters::scenario_unhook_all_libs);
    run("ldiv", aggregate::scenario_register_pair_return);
    run("large", aggregate::scenario_large_by_value);
    run("foreign-clock", peer::scenario_foreign_clock_binding);
    run("float-args", peer::scenario_float_arguments);
    run("large-got", peer::scenario_large_through_got);
    run("no-chaining-call-prev", peer::scenario_call_prev_from_no_chaining_aborts);
    run("stress", stress::scenario_toggle_under_load);
    if env_flag("HOOK_TEST_MARATHON") {
        run("stress-marathon", stress::scenario_toggle_marathon);
    }
}

unsafe fn run(name: &str, scenario: unsafe fn()) {
    println!("scenario: {name}");
    scenario();
}
