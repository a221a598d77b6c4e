// kernel/src/kernel/error.rs
//
// プロセス core のエラー種別。
// - system call 境界では全部 SENTINEL（-1）に潰す。
// - 内部では種類を保ったまま ? で伝播し、ログとイベントに残す。

use core::fmt;

use crate::config::ConfigError;
use crate::fs::FsError;
use crate::kernel::InvariantViolation;
use crate::mem::address_space::AddressSpaceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// 空き PCB slot が無い
    RegistryExhausted,
    /// present なページへ map しようとした
    MappingConflict,
    /// map されていないページを remap しようとした
    MappingAbsent,
    /// 空 / 形式不正のコマンド行
    InvalidCommand,
    ExecutableNotFound,
    /// magic 不一致 / entry が窓の外 / イメージが窓に収まらない
    ExecutableMalformed,
    /// 空き fd が無い
    DescriptorExhausted,
    /// 範囲外 / 未 open の fd
    InvalidDescriptor,
    UnknownProcess,
    NoCurrentProcess,
    AddressSpace(AddressSpaceError),
    Fs(FsError),
    Config(ConfigError),
    /// その fd / 種別では許されない操作（stdin への write など）
    Unsupported,
    BadArgument,
    Device,
    /// 状態の整合性チェックが落ちた（中身は破れた条件）
    InvariantBroken(&'static str),
}

impl KernelError {
    /// system call の失敗値
    pub const SENTINEL: i32 = -1;

    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::RegistryExhausted => "registry exhausted",
            KernelError::MappingConflict => "mapping conflict",
            KernelError::MappingAbsent => "mapping absent",
            KernelError::InvalidCommand => "invalid command",
            KernelError::ExecutableNotFound => "executable not found",
            KernelError::ExecutableMalformed => "executable malformed",
            KernelError::DescriptorExhausted => "descriptor table full",
            KernelError::InvalidDescriptor => "invalid descriptor",
            KernelError::UnknownProcess => "unknown process",
            KernelError::NoCurrentProcess => "no current process",
            KernelError::AddressSpace(_) => "address space error",
            KernelError::Fs(_) => "file system error",
            KernelError::Config(_) => "bad configuration",
            KernelError::Unsupported => "unsupported operation",
            KernelError::BadArgument => "bad argument",
            KernelError::Device => "device error",
            KernelError::InvariantBroken(_) => "kernel invariant broken",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::AddressSpace(e) => write!(f, "{}: {}", self.as_str(), e),
            KernelError::Fs(e) => write!(f, "{}: {}", self.as_str(), e),
            KernelError::Config(e) => write!(f, "{}: {}", self.as_str(), e),
            KernelError::InvariantBroken(what) => write!(f, "{}: {}", self.as_str(), what),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl From<AddressSpaceError> for KernelError {
    fn from(e: AddressSpaceError) -> Self {
        match e {
            AddressSpaceError::MappingConflict => KernelError::MappingConflict,
            AddressSpaceError::MappingAbsent => KernelError::MappingAbsent,
            other => KernelError::AddressSpace(other),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(e: FsError) -> Self {
        KernelError::Fs(e)
    }
}

impl From<ConfigError> for KernelError {
    fn from(e: ConfigError) -> Self {
        KernelError::Config(e)
    }
}

impl From<InvariantViolation> for KernelError {
    fn from(v: InvariantViolation) -> Self {
        KernelError::InvariantBroken(v.0)
    }
}

/// system call の戻り値に潰す
pub fn to_syscall_value<T: TryInto<i32>>(r: Result<T, KernelError>) -> i32 {
    match r {
        Ok(v) => v.try_into().unwrap_or(KernelError::SENTINEL),
        Err(_) => KernelError::SENTINEL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn mapping_errors_keep_their_kind() {
        assert_eq!(
            KernelError::from(AddressSpaceError::MappingConflict),
            KernelError::MappingConflict
        );
        assert_eq!(
            KernelError::from(AddressSpaceError::NotOwned),
            KernelError::AddressSpace(AddressSpaceError::NotOwned)
        );
    }

    #[test]
    fn syscall_values() {
        assert_eq!(to_syscall_value::<usize>(Ok(12)), 12);
        assert_eq!(to_syscall_value::<usize>(Err(KernelError::InvalidDescriptor)), -1);
        assert_eq!(to_syscall_value::<usize>(Ok(usize::MAX)), -1);
        assert_eq!(
            KernelError::Fs(FsError::NotFound).to_string(),
            "file system error: file not found"
        );
    }

    #[test]
    fn invariant_failures_have_their_own_kind() {
        let e = KernelError::from(InvariantViolation("process left half launched"));
        assert_eq!(e, KernelError::InvariantBroken("process left half launched"));
        assert_ne!(e, KernelError::Unsupported);
        assert_eq!(
            e.to_string(),
            "kernel invariant broken: process left half launched"
        );
    }
}
