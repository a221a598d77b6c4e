// kernel/src/kernel/syscall.rs
//
// system call 境界
// - 番号 1..=10 を型付きの Syscall に直してから KernelState に渡す
// - 失敗は全部 -1（KernelError::SENTINEL）
// - halt / execute だけは制御の行き先が変わるので Transfer をそのまま返す
//
// ユーザポインタの検証と、ユーザ空間のバッファをスライスにするのは arch 側の仕事。
// ここに来る bytes はすでに有効化済みの空間の中を指している前提。

use crate::arch::ring3::SavedContext;
use crate::arch::Machine;
use crate::config::MAX_OPEN_FILES;
use crate::fs::FileSystem;
use crate::kernel::command;
use crate::kernel::devices::Devices;
use crate::kernel::error::to_syscall_value;
use crate::kernel::fd::{self, IoContext, OpenFile, FIRST_USER_FD};
use crate::kernel::halt::HaltCause;
use crate::kernel::{KernelError, KernelState, Transfer};
use crate::logging;

pub const SYS_HALT: u32 = 1;
pub const SYS_EXECUTE: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_WRITE: u32 = 4;
pub const SYS_OPEN: u32 = 5;
pub const SYS_CLOSE: u32 = 6;
pub const SYS_GETARGS: u32 = 7;
pub const SYS_VIDMAP: u32 = 8;
pub const SYS_SET_HANDLER: u32 = 9;
pub const SYS_SIGRETURN: u32 = 10;

#[derive(Debug, PartialEq, Eq)]
pub enum Syscall<'a> {
    Halt(u8),
    Execute(&'a [u8]),
    Read { fd: i32, buf: &'a mut [u8] },
    Write { fd: i32, buf: &'a [u8] },
    Open(&'a [u8]),
    Close(i32),
    GetArgs(&'a mut [u8]),
    /// dest は呼び出し側がビデオページのアドレスを書き込む先
    Vidmap { dest: u32 },
    SetHandler,
    SigReturn,
}

impl<'a> Syscall<'a> {
    /// arg は ebx（終了コード / fd / 書き込み先）、bytes はユーザバッファ。
    pub fn decode(number: u32, arg: u32, bytes: &'a mut [u8]) -> Option<Syscall<'a>> {
        let call = match number {
            SYS_HALT => Syscall::Halt(arg as u8),
            SYS_EXECUTE => Syscall::Execute(bytes),
            SYS_READ => Syscall::Read { fd: arg as i32, buf: bytes },
            SYS_WRITE => Syscall::Write { fd: arg as i32, buf: bytes },
            SYS_OPEN => Syscall::Open(bytes),
            SYS_CLOSE => Syscall::Close(arg as i32),
            SYS_GETARGS => Syscall::GetArgs(bytes),
            SYS_VIDMAP => Syscall::Vidmap { dest: arg },
            SYS_SET_HANDLER => Syscall::SetHandler,
            SYS_SIGRETURN => Syscall::SigReturn,
            _ => return None,
        };
        Some(call)
    }

    pub fn number(&self) -> u32 {
        match self {
            Syscall::Halt(_) => SYS_HALT,
            Syscall::Execute(_) => SYS_EXECUTE,
            Syscall::Read { .. } => SYS_READ,
            Syscall::Write { .. } => SYS_WRITE,
            Syscall::Open(_) => SYS_OPEN,
            Syscall::Close(_) => SYS_CLOSE,
            Syscall::GetArgs(_) => SYS_GETARGS,
            Syscall::Vidmap { .. } => SYS_VIDMAP,
            Syscall::SetHandler => SYS_SET_HANDLER,
            Syscall::SigReturn => SYS_SIGRETURN,
        }
    }
}

/// fd を [0, MAX_OPEN_FILES) に収める
fn descriptor_index(fd: i32) -> Result<usize, KernelError> {
    usize::try_from(fd)
        .ok()
        .filter(|&fd| fd < MAX_OPEN_FILES)
        .ok_or(KernelError::InvalidDescriptor)
}

impl<M: Machine, D: Devices, F: FileSystem> KernelState<M, D, F> {
    /// int 0x80 の入口（番号と引数そのまま）
    pub fn syscall_raw(&mut self, number: u32, arg: u32, bytes: &mut [u8], caller: SavedContext) -> Transfer {
        match Syscall::decode(number, arg, bytes) {
            Some(call) => self.syscall(call, caller),
            None => {
                logging::warn("syscall: unknown number");
                logging::info_u64(" number", number as u64);
                Transfer::Return(KernelError::SENTINEL)
            }
        }
    }

    pub fn syscall(&mut self, call: Syscall<'_>, caller: SavedContext) -> Transfer {
        let value = match call {
            Syscall::Halt(code) => return self.halt(HaltCause::Exit(code)),
            Syscall::Execute(command) => return self.execute(command, caller),
            Syscall::Read { fd, buf } => to_syscall_value(self.sys_read(fd, buf)),
            Syscall::Write { fd, buf } => to_syscall_value(self.sys_write(fd, buf)),
            Syscall::Open(name) => to_syscall_value(self.sys_open(name)),
            Syscall::Close(fd) => to_syscall_value(self.sys_close(fd).map(|()| 0)),
            Syscall::GetArgs(buf) => to_syscall_value(self.sys_getargs(buf).map(|()| 0)),
            Syscall::Vidmap { dest } => to_syscall_value(self.sys_vidmap(dest)),
            Syscall::SetHandler | Syscall::SigReturn => KernelError::SENTINEL,
        };
        Transfer::Return(value)
    }

    fn sys_read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize, KernelError> {
        let fd = descriptor_index(fd)?;
        let pid = self.registry.current().ok_or(KernelError::NoCurrentProcess)?;
        let pcb = self.registry.get_mut(pid)?;
        let terminal = pcb.terminal;
        let file = pcb.files.get_mut(fd).ok_or(KernelError::InvalidDescriptor)?;
        let read = file.ops.read;
        let mut io = IoContext {
            fs: &self.fs,
            devices: &mut self.devices,
            terminal,
        };
        read(&mut io, file, buf)
    }

    fn sys_write(&mut self, fd: i32, buf: &[u8]) -> Result<usize, KernelError> {
        let fd = descriptor_index(fd)?;
        let pid = self.registry.current().ok_or(KernelError::NoCurrentProcess)?;
        let pcb = self.registry.get_mut(pid)?;
        let terminal = pcb.terminal;
        let file = pcb.files.get_mut(fd).ok_or(KernelError::InvalidDescriptor)?;
        let write = file.ops.write;
        let mut io = IoContext {
            fs: &self.fs,
            devices: &mut self.devices,
            terminal,
        };
        write(&mut io, file, buf)
    }

    fn sys_open(&mut self, name: &[u8]) -> Result<usize, KernelError> {
        self.critical(|k| k.open_locked(name))
    }

    fn open_locked(&mut self, name: &[u8]) -> Result<usize, KernelError> {
        let pid = self.registry.current().ok_or(KernelError::NoCurrentProcess)?;
        let dentry = self.fs.lookup(command::trim_nul(name))?;
        let fd = self.registry.find_free_descriptor(pid)?;
        let ops = fd::ops_for(dentry.file_type);

        let terminal = self.registry.get(pid)?.terminal;
        let mut io = IoContext {
            fs: &self.fs,
            devices: &mut self.devices,
            terminal,
        };
        (ops.open)(&mut io, &dentry)?;

        self.registry
            .get_mut(pid)?
            .files
            .install(fd, OpenFile::new(ops, dentry.inode))?;
        Ok(fd)
    }

    fn sys_close(&mut self, fd: i32) -> Result<(), KernelError> {
        let fd = descriptor_index(fd)?;
        if fd < FIRST_USER_FD {
            return Err(KernelError::InvalidDescriptor);
        }
        self.critical(|k| k.close_locked(fd))
    }

    fn close_locked(&mut self, fd: usize) -> Result<(), KernelError> {
        let pid = self.registry.current().ok_or(KernelError::NoCurrentProcess)?;
        let pcb = self.registry.get_mut(pid)?;
        let terminal = pcb.terminal;
        let file = pcb.files.get_mut(fd).ok_or(KernelError::InvalidDescriptor)?;
        let close = file.ops.close;
        let mut io = IoContext {
            fs: &self.fs,
            devices: &mut self.devices,
            terminal,
        };
        close(&mut io, file)?;
        pcb.files.take(fd);
        Ok(())
    }

    /// 引数の残りを NUL 付きで写す
    fn sys_getargs(&mut self, buf: &mut [u8]) -> Result<(), KernelError> {
        let pid = self.registry.current().ok_or(KernelError::NoCurrentProcess)?;
        let args = self.registry.get(pid)?.args;
        let n = args.len();
        if n == 0 || buf.len() < n + 1 {
            return Err(KernelError::BadArgument);
        }
        buf[..n].copy_from_slice(args.as_bytes());
        buf[n] = 0;
        Ok(())
    }

    /// dest がプログラム窓の中なら、ユーザ用ビデオページのアドレスを返す
    fn sys_vidmap(&mut self, dest: u32) -> Result<usize, KernelError> {
        self.registry.current().ok_or(KernelError::NoCurrentProcess)?;
        if !self.layout.in_program_window(dest) {
            return Err(KernelError::BadArgument);
        }
        Ok(self.layout.video.0 as usize)
    }
}
