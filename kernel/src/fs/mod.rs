// kernel/src/fs/mod.rs
//
// 役割:
// - プロセス core から見た読み取り専用ファイルシステムの窓口（FileSystem trait）。
// - ブートモジュールとして渡されるイメージ形式の実装（image::ReadOnlyFs）。
//
// やらないこと:
// - 書き込み / 作成 / 削除（イメージは読み取り専用）

pub mod image;

use core::fmt;

pub use image::ReadOnlyFs;

/// ファイル名の最大長（NUL 終端なしで 32 バイトまで）
pub const MAX_FILE_NAME: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// RTC デバイス
    Rtc,
    Directory,
    Regular,
}

impl FileType {
    pub fn from_raw(raw: u32) -> Option<FileType> {
        match raw {
            0 => Some(FileType::Rtc),
            1 => Some(FileType::Directory),
            2 => Some(FileType::Regular),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            FileType::Rtc => 0,
            FileType::Directory => 1,
            FileType::Regular => 2,
        }
    }
}

/// ディレクトリエントリ（名前は NUL 埋め 32 バイト）
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Dentry {
    name: [u8; MAX_FILE_NAME],
    pub file_type: FileType,
    pub inode: u32,
}

impl Dentry {
    pub fn new(name: &[u8], file_type: FileType, inode: u32) -> Dentry {
        let mut buf = [0u8; MAX_FILE_NAME];
        let len = name.len().min(MAX_FILE_NAME);
        buf[..len].copy_from_slice(&name[..len]);
        Dentry { name: buf, file_type, inode }
    }

    /// NUL までの名前
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_FILE_NAME);
        &self.name[..len]
    }
}

impl fmt::Debug for Dentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dentry")
            .field("name", &core::str::from_utf8(self.name()).unwrap_or("?"))
            .field("file_type", &self.file_type)
            .field("inode", &self.inode)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    /// inode 番号が範囲外
    BadInode,
    /// ディレクトリ index が範囲外
    BadIndex,
    /// イメージの構造が壊れている（ブロック番号範囲外、長さ不足など）
    Corrupt,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsError::NotFound => "file not found",
            FsError::BadInode => "bad inode",
            FsError::BadIndex => "bad directory index",
            FsError::Corrupt => "corrupt file system image",
        };
        f.write_str(s)
    }
}

/// プロセス core が使う読み取り専用ファイルシステム
pub trait FileSystem {
    fn lookup(&self, name: &[u8]) -> Result<Dentry, FsError>;
    fn dentry_at(&self, index: u32) -> Result<Dentry, FsError>;
    fn dentry_count(&self) -> u32;
    fn file_len(&self, inode: u32) -> Result<u32, FsError>;
    /// offset から buf.len() バイトまで読む。EOF 以降は 0。
    fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> Result<usize, FsError>;
}
