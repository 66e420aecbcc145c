// hook 操作错误码，0 表示成功，编号固定
use thiserror::Error;

#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum Errno {
    #[error("ok")]
    Ok = 0,
    #[error("invalid argument")]
    InvalidArg = 1,
    // 违反 no-chaining 独占约束
    #[error("slot is held by a conflicting hook")]
    Conflict = 3,
    #[error("failed to read page protection")]
    GetProt = 4,
    #[error("failed to change page protection")]
    SetProt = 5,
    #[error("slot verification failed after write")]
    GotVerify = 7,
    #[error("failed to create trampoline")]
    NewTrampo = 8,
    #[error("malformed elf metadata")]
    Format = 10,
    #[error("failed to parse /proc/self/maps")]
    BadMaps = 11,
    // 在过滤回调内部重入 registry
    #[error("registry re-entered from a filter callback")]
    Reentrant = 13,
}

impl Errno {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<Errno> for i32 {
    fn from(value: Errno) -> Self {
        value as i32
    }
}
