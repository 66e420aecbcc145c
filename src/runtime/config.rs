// registry 配置：调试开关与延迟回收时长，可由环境变量覆盖
use std::time::Duration;

const ENV_DEBUG: &str = "PLT_CHAIN_DEBUG";
const ENV_RECLAIM_DELAY: &str = "PLT_CHAIN_RECLAIM_DELAY_SEC";

// 被摘除的链快照与 hub 至少保留这么久，覆盖仍停留在 trampoline 入口指令上的线程
const DEFAULT_RECLAIM_DELAY: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistryConfig {
    pub debug: bool,
    pub reclaim_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            debug: false,
            reclaim_delay: DEFAULT_RECLAIM_DELAY,
        }
    }
}

impl RegistryConfig {
    /// 从 `PLT_CHAIN_DEBUG` 与 `PLT_CHAIN_RECLAIM_DELAY_SEC` 读取，缺失或非法时取默认值。
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let debug = lookup(ENV_DEBUG)
            .and_then(|value| parse_flag(&value))
            .unwrap_or(defaults.debug);
        let reclaim_delay = lookup(ENV_RECLAIM_DELAY)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.reclaim_delay);
        Self {
            debug,
            reclaim_delay,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
