const VERSION_STR: &str = env!("CARGO_PKG_VERSION");

#[cfg(target_arch = "aarch64")]
const VERSION_ARCH: &str = "aarch64";
#[cfg(target_arch = "x86_64")]
const VERSION_ARCH: &str = "x86_64";

// major << 16 | minor << 8 | patch
pub fn version() -> u32 {
    encode(VERSION_STR)
}

pub fn version_str() -> &'static str {
    VERSION_STR
}

pub fn version_str_full() -> String {
    format!("plt_chain {} ({})", version_str(), VERSION_ARCH)
}

// 预发布与构建元数据后缀不参与编码
fn encode(text: &str) -> u32 {
    let normalized = text.split(['-', '+']).next().unwrap_or(text);
    let mut parts = normalized.split('.').map(|part| part.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major << 16) | (minor << 8) | patch
}
