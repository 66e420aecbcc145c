use std::env;
use std::path::PathBuf;
use std::process::Command;

// 用 rustc 直接编出 fixtures/ 下的两个动态库：libpeer_client.so 依赖 libpeer.so
fn main() {
    println!("cargo:rerun-if-changed=fixtures");
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let target = env::var("TARGET").expect("TARGET not set");
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());

    // 顺序即构建顺序，依赖方在后
    let fixtures = [("peer", false), ("peer_client", true)];
    for (crate_name, links_peer) in fixtures {
        let src = format!("fixtures/{crate_name}.rs");
        let mut cmd = Command::new(&rustc);
        cmd.arg(&src)
            .arg("--crate-type=cdylib")
            .arg("--crate-name")
            .arg(crate_name)
            .arg("--edition=2024")
            .arg("--target")
            .arg(&target)
            .arg("-O")
            .arg("-C")
            .arg("panic=abort")
            .arg("--out-dir")
            .arg(&out_dir);
        if links_peer {
            cmd.arg("-L")
                .arg(format!("native={}", out_dir.display()))
                .arg("-C")
                .arg("link-arg=-Wl,-rpath,$ORIGIN");
        }
        let status = cmd.status().expect("failed to run rustc");
        assert!(status.success(), "failed to compile {src}");
    }

    println!("cargo:rustc-env=HOOK_TEST_FIXTURES={}", out_dir.display());
}
