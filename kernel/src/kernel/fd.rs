// kernel/src/kernel/fd.rs
//
// 役割:
// - ファイル記述子表（8 slot）と、open 時に種別ごとに束ねる操作表（FileOps）。
//
// やること:
// - 0 / 1 は stdin / stdout に固定。2..8 を open で埋める。
// - FileOps は static な関数表。OpenFile は表への参照と位置カーソルと inode を持つ。
//
// やらないこと:
// - 書き込み可能なファイル（イメージは読み取り専用）
//
// 設計方針:
// - 空き slot は None。中途半端に埋まった slot は作らない。

use crate::config::MAX_OPEN_FILES;
use crate::fs::{Dentry, FileSystem, FileType};
use crate::kernel::devices::Devices;
use crate::kernel::terminal::TerminalId;
use crate::kernel::KernelError;

pub const STDIN_FD: usize = 0;
pub const STDOUT_FD: usize = 1;
/// open が割り当てる最初の fd
pub const FIRST_USER_FD: usize = 2;

/// RTC write が受け付ける周波数
const RTC_MIN_HZ: u32 = 2;
const RTC_MAX_HZ: u32 = 1024;

/// 操作が届く先（ファイルシステム / デバイス / 呼び出し元の端末）
pub struct IoContext<'a> {
    pub fs: &'a dyn FileSystem,
    pub devices: &'a mut dyn Devices,
    pub terminal: TerminalId,
}

pub type OpenFn = fn(&mut IoContext<'_>, &Dentry) -> Result<(), KernelError>;
pub type ReadFn = fn(&mut IoContext<'_>, &mut OpenFile, &mut [u8]) -> Result<usize, KernelError>;
pub type WriteFn = fn(&mut IoContext<'_>, &mut OpenFile, &[u8]) -> Result<usize, KernelError>;
pub type CloseFn = fn(&mut IoContext<'_>, &mut OpenFile) -> Result<(), KernelError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Stdin,
    Stdout,
    Rtc,
    Directory,
    Regular,
}

pub struct FileOps {
    pub kind: FileKind,
    pub open: OpenFn,
    pub read: ReadFn,
    pub write: WriteFn,
    pub close: CloseFn,
}

pub static STDIN_OPS: FileOps = FileOps {
    kind: FileKind::Stdin,
    open: open_nothing,
    read: terminal_read,
    write: refuse_write,
    close: refuse_close,
};

pub static STDOUT_OPS: FileOps = FileOps {
    kind: FileKind::Stdout,
    open: open_nothing,
    read: refuse_read,
    write: terminal_write,
    close: refuse_close,
};

pub static RTC_OPS: FileOps = FileOps {
    kind: FileKind::Rtc,
    open: rtc_open,
    read: rtc_read,
    write: rtc_write,
    close: close_nothing,
};

pub static DIRECTORY_OPS: FileOps = FileOps {
    kind: FileKind::Directory,
    open: open_nothing,
    read: directory_read,
    write: refuse_write,
    close: close_nothing,
};

pub static REGULAR_FILE_OPS: FileOps = FileOps {
    kind: FileKind::Regular,
    open: open_nothing,
    read: regular_read,
    write: refuse_write,
    close: close_nothing,
};

/// dentry の種別に対応する操作表
pub fn ops_for(file_type: FileType) -> &'static FileOps {
    match file_type {
        FileType::Rtc => &RTC_OPS,
        FileType::Directory => &DIRECTORY_OPS,
        FileType::Regular => &REGULAR_FILE_OPS,
    }
}

#[derive(Clone, Copy)]
pub struct OpenFile {
    pub ops: &'static FileOps,
    pub position: u32,
    pub inode: u32,
}

impl OpenFile {
    pub fn new(ops: &'static FileOps, inode: u32) -> Self {
        OpenFile { ops, position: 0, inode }
    }

    pub fn kind(&self) -> FileKind {
        self.ops.kind
    }
}

// 操作表は kind と 1 対 1 なので kind で比べる
impl PartialEq for OpenFile {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.position == other.position && self.inode == other.inode
    }
}

impl Eq for OpenFile {}

impl core::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpenFile")
            .field("kind", &self.kind())
            .field("position", &self.position)
            .field("inode", &self.inode)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTable {
    slots: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl FileTable {
    /// stdin / stdout だけが埋まった表
    pub fn with_std_streams() -> Self {
        let mut slots = [None; MAX_OPEN_FILES];
        slots[STDIN_FD] = Some(OpenFile::new(&STDIN_OPS, 0));
        slots[STDOUT_FD] = Some(OpenFile::new(&STDOUT_OPS, 0));
        FileTable { slots }
    }

    pub fn get(&self, fd: usize) -> Option<&OpenFile> {
        self.slots.get(fd)?.as_ref()
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut OpenFile> {
        self.slots.get_mut(fd)?.as_mut()
    }

    /// 2 以上で一番小さい空き
    pub fn find_free(&self) -> Option<usize> {
        (FIRST_USER_FD..MAX_OPEN_FILES).find(|&fd| self.slots[fd].is_none())
    }

    pub fn install(&mut self, fd: usize, file: OpenFile) -> Result<(), KernelError> {
        match self.slots.get_mut(fd) {
            Some(slot @ None) if fd >= FIRST_USER_FD => {
                *slot = Some(file);
                Ok(())
            }
            _ => Err(KernelError::InvalidDescriptor),
        }
    }

    /// fd >= 2 の slot を空にして中身を返す
    pub fn take(&mut self, fd: usize) -> Option<OpenFile> {
        if fd < FIRST_USER_FD {
            return None;
        }
        self.slots.get_mut(fd)?.take()
    }

    pub fn open_user_fds(&self) -> impl Iterator<Item = usize> + '_ {
        (FIRST_USER_FD..MAX_OPEN_FILES).filter(move |&fd| self.slots[fd].is_some())
    }
}

//
// 操作の実体
//

fn open_nothing(_io: &mut IoContext<'_>, _dentry: &Dentry) -> Result<(), KernelError> {
    Ok(())
}

fn close_nothing(_io: &mut IoContext<'_>, _file: &mut OpenFile) -> Result<(), KernelError> {
    Ok(())
}

fn refuse_read(_io: &mut IoContext<'_>, _file: &mut OpenFile, _buf: &mut [u8]) -> Result<usize, KernelError> {
    Err(KernelError::Unsupported)
}

fn refuse_write(_io: &mut IoContext<'_>, _file: &mut OpenFile, _buf: &[u8]) -> Result<usize, KernelError> {
    Err(KernelError::Unsupported)
}

fn refuse_close(_io: &mut IoContext<'_>, _file: &mut OpenFile) -> Result<(), KernelError> {
    Err(KernelError::InvalidDescriptor)
}

fn terminal_read(io: &mut IoContext<'_>, _file: &mut OpenFile, buf: &mut [u8]) -> Result<usize, KernelError> {
    io.devices.terminal_read(io.terminal, buf)
}

fn terminal_write(io: &mut IoContext<'_>, _file: &mut OpenFile, buf: &[u8]) -> Result<usize, KernelError> {
    io.devices.terminal_write(io.terminal, buf)
}

fn rtc_open(io: &mut IoContext<'_>, _dentry: &Dentry) -> Result<(), KernelError> {
    io.devices.rtc_open()
}

/// 次の tick まで待って 0 を返す
fn rtc_read(io: &mut IoContext<'_>, _file: &mut OpenFile, _buf: &mut [u8]) -> Result<usize, KernelError> {
    io.devices.rtc_wait()?;
    Ok(0)
}

fn rtc_write(io: &mut IoContext<'_>, _file: &mut OpenFile, buf: &[u8]) -> Result<usize, KernelError> {
    let raw: [u8; 4] = buf.try_into().map_err(|_| KernelError::BadArgument)?;
    let hz = u32::from_le_bytes(raw);
    if !hz.is_power_of_two() || !(RTC_MIN_HZ..=RTC_MAX_HZ).contains(&hz) {
        return Err(KernelError::BadArgument);
    }
    io.devices.rtc_set_frequency(hz)?;
    Ok(buf.len())
}

/// 呼ぶたびに 1 エントリ分の名前を返す。終わりは 0。
fn directory_read(io: &mut IoContext<'_>, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize, KernelError> {
    if file.position >= io.fs.dentry_count() {
        return Ok(0);
    }
    let dentry = io.fs.dentry_at(file.position)?;
    let name = dentry.name();
    let n = name.len().min(buf.len());
    buf[..n].copy_from_slice(&name[..n]);
    file.position += 1;
    Ok(n)
}

fn regular_read(io: &mut IoContext<'_>, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize, KernelError> {
    let n = io.fs.read_data(file.inode, file.position, buf)?;
    file.position += n as u32;
    Ok(n)
}
