// 库名匹配规则解析与判定
// 规则形如 path[@base]，base 为十六进制加载基址
use once_cell::sync::Lazy;
use regex::Regex;

// 末尾的 soname 版本号，如 libc.so.6 中的 ".6"
static SONAME_VERSION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\.\d+)+$").ok());

struct LibraryRule<'a> {
    path_rule: &'a str,
    base_rule: Option<usize>,
}

// 完整匹配：路径 + 可选的 base 限定
pub(crate) fn library_match(pathname: &str, base_addr: usize, rule: &str) -> bool {
    let Some(rule) = parse_library_rule(rule) else {
        return false;
    };
    if rule.base_rule.is_some_and(|base| base != base_addr) {
        return false;
    }
    path_match(pathname, rule.path_rule) || path_match(strip_soname_version(pathname), rule.path_rule)
}

// 绝对路径要求完全相等，相对路径只在 '/' 边界上做后缀匹配
fn path_match(pathname: &str, path_rule: &str) -> bool {
    if path_rule.starts_with('/') {
        return pathname == path_rule;
    }
    match pathname.strip_suffix(path_rule) {
        Some("") => true,
        Some(head) => head.ends_with('/'),
        None => false,
    }
}

fn strip_soname_version(pathname: &str) -> &str {
    let Some(pattern) = SONAME_VERSION.as_ref() else {
        return pathname;
    };
    match pattern.find(pathname) {
        Some(m) if pathname[..m.start()].ends_with(".so") => &pathname[..m.start()],
        _ => pathname,
    }
}

fn parse_library_rule(rule: &str) -> Option<LibraryRule<'_>> {
    if rule.is_empty() {
        return None;
    }
    let Some((path_rule, base_rule)) = rule.rsplit_once('@') else {
        return Some(LibraryRule {
            path_rule: rule,
            base_rule: None,
        });
    };
    if path_rule.is_empty() {
        return None;
    }
    // '@' 后不是十六进制时整体当作路径
    match parse_hex_usize(base_rule) {
        Some(base_addr) => Some(LibraryRule {
            path_rule,
            base_rule: Some(base_addr),
        }),
        None => Some(LibraryRule {
            path_rule: rule,
            base_rule: None,
        }),
    }
}

fn parse_hex_usize(rule: &str) -> Option<usize> {
    let value = rule
        .strip_prefix("0x")
        .or_else(|| rule.strip_prefix("0X"))
        .unwrap_or(rule);
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(value, 16).ok()
}
