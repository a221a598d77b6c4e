// kernel/src/kernel/command.rs
//
// コマンド行 "name args..." の分解。
// - 入力は最初の NUL で終わる（ユーザ空間から来る C 文字列）
// - 先頭が区切り（空白）ならエラー
// - 最初の空白の並びで name と引数の残り（生のまま）に分ける
// - name ≤ 32 バイト、引数 ≤ 128 バイト

use core::fmt;

use crate::config::{MAX_ARGS_LEN, MAX_NAME_LEN};
use crate::kernel::KernelError;

const SEPARATOR: u8 = b' ';

/// heap なしの固定長バイト列
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedText<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedText<N> {
    pub const EMPTY: Self = FixedText { bytes: [0; N], len: 0 };

    /// N バイトを超えるなら None
    pub fn from_bytes(src: &[u8]) -> Option<Self> {
        if src.len() > N {
            return None;
        }
        let mut bytes = [0u8; N];
        bytes[..src.len()].copy_from_slice(src);
        Some(FixedText { bytes, len: src.len() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> fmt::Debug for FixedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

pub type CommandName = FixedText<MAX_NAME_LEN>;
pub type CommandArgs = FixedText<MAX_ARGS_LEN>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: CommandName,
    pub args: CommandArgs,
}

/// 最初の NUL までを返す
pub fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

pub fn parse(command: &[u8]) -> Result<ParsedCommand, KernelError> {
    let command = trim_nul(command);
    match command.first() {
        None | Some(&SEPARATOR) => return Err(KernelError::InvalidCommand),
        Some(_) => {}
    }

    let name_end = command
        .iter()
        .position(|&b| b == SEPARATOR)
        .unwrap_or(command.len());
    let rest = &command[name_end..];
    let args_start = rest
        .iter()
        .position(|&b| b != SEPARATOR)
        .unwrap_or(rest.len());

    let name = CommandName::from_bytes(&command[..name_end]).ok_or(KernelError::InvalidCommand)?;
    let args = CommandArgs::from_bytes(&rest[args_start..]).ok_or(KernelError::InvalidCommand)?;
    Ok(ParsedCommand { name, args })
}
