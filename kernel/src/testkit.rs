// kernel/src/testkit.rs
//
// ホストテスト用の部品。
// - FsImageBuilder: ReadOnlyFs 形式のイメージを組み立てる
// - RecordingDevices: 端末入出力と RTC 操作を記録するだけの Devices
// - booted(): 標準イメージで boot 済みの KernelState

use std::collections::VecDeque;
use std::vec::Vec;

use crate::arch::gdt::KERNEL_DS;
use crate::arch::ring3::SavedContext;
use crate::arch::sim::SimMachine;
use crate::config::{Layout, TimerConfig, NUM_TERMINALS};
use crate::fs::image::{BLOCK_SIZE, BOOT_HEADER_SIZE, DENTRY_SIZE};
use crate::fs::{FileType, ReadOnlyFs};
use crate::kernel::devices::Devices;
use crate::kernel::exec::{EXEC_MAGIC, HEADER_LEN};
use crate::kernel::terminal::TerminalId;
use crate::kernel::{KernelError, KernelState, Transfer};

//
// FsImageBuilder
//

struct Entry {
    name: Vec<u8>,
    file_type: FileType,
    data: Vec<u8>,
    /// inode に書く長さ（None なら data の長さ）
    declared_len: Option<u32>,
}

#[derive(Default)]
pub struct FsImageBuilder {
    entries: Vec<Entry>,
}

impl FsImageBuilder {
    pub fn new() -> Self {
        FsImageBuilder::default()
    }

    pub fn dir(self, name: &[u8]) -> Self {
        self.push(name, FileType::Directory, &[], None)
    }

    pub fn rtc(self, name: &[u8]) -> Self {
        self.push(name, FileType::Rtc, &[], None)
    }

    pub fn file(self, name: &[u8], data: &[u8]) -> Self {
        self.push(name, FileType::Regular, data, None)
    }

    /// 中身は data だけ置き、inode には declared_len を書く
    pub fn sized_file(self, name: &[u8], data: &[u8], declared_len: u32) -> Self {
        self.push(name, FileType::Regular, data, Some(declared_len))
    }

    fn push(mut self, name: &[u8], file_type: FileType, data: &[u8], declared_len: Option<u32>) -> Self {
        self.entries.push(Entry {
            name: name.to_vec(),
            file_type,
            data: data.to_vec(),
            declared_len,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let files: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|e| e.file_type == FileType::Regular)
            .collect();
        let num_inodes = files.len();
        let num_blocks: usize = files.iter().map(|e| e.data.len().div_ceil(BLOCK_SIZE)).sum();

        let mut image = vec![0u8; BLOCK_SIZE * (1 + num_inodes + num_blocks)];
        put_u32(&mut image, 0, self.entries.len() as u32);
        put_u32(&mut image, 4, num_inodes as u32);
        put_u32(&mut image, 8, num_blocks as u32);

        let mut inode = 0u32;
        for (i, e) in self.entries.iter().enumerate() {
            let base = BOOT_HEADER_SIZE + DENTRY_SIZE * i;
            image[base..base + e.name.len()].copy_from_slice(&e.name);
            put_u32(&mut image, base + 32, e.file_type.as_raw());
            if e.file_type == FileType::Regular {
                put_u32(&mut image, base + 36, inode);
                inode += 1;
            }
        }

        let mut next_block = 0usize;
        for (i, e) in files.iter().enumerate() {
            let inode_base = BLOCK_SIZE * (1 + i);
            let len = e.declared_len.unwrap_or(e.data.len() as u32);
            put_u32(&mut image, inode_base, len);
            for (slot, chunk) in e.data.chunks(BLOCK_SIZE).enumerate() {
                put_u32(&mut image, inode_base + 4 + 4 * slot, next_block as u32);
                let at = BLOCK_SIZE * (1 + num_inodes + next_block);
                image[at..at + chunk.len()].copy_from_slice(chunk);
                next_block += 1;
            }
        }
        image
    }
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

//
// 実行ファイル
//

pub const SHELL_ENTRY: u32 = 0x0804_80E8;

/// magic と entry だけ正しい len バイトの実行ファイル
pub fn program(entry: u32, len: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..len.max(HEADER_LEN)).map(|i| (i % 253) as u8).collect();
    bytes[..EXEC_MAGIC.len()].copy_from_slice(&EXEC_MAGIC);
    bytes[24..28].copy_from_slice(&entry.to_le_bytes());
    bytes.truncate(len);
    bytes
}

pub const FRAME0: &[u8] = b"<\"((((((((((o>< fish swims\n";

/// boot に必要なもの一式
pub fn standard_image() -> &'static [u8] {
    let mut bad_magic = program(SHELL_ENTRY, 200);
    bad_magic[0] = 0;
    let image = FsImageBuilder::new()
        .dir(b".")
        .rtc(b"rtc")
        .file(b"shell", &program(SHELL_ENTRY, 3000))
        .file(b"ls", &program(0x0804_8100, 800))
        .file(b"cat", &program(0x0804_8200, 900))
        .file(b"counter", &program(0x0804_8300, 5000))
        .file(b"frame0.txt", FRAME0)
        .file(b"badmagic", &bad_magic)
        .file(b"farentry", &program(0x0900_0000, 200))
        .file(b"short", &program(SHELL_ENTRY, 10))
        .sized_file(b"huge", &program(SHELL_ENTRY, 200), 0x0040_0000)
        .build();
    Vec::leak(image)
}

//
// RecordingDevices
//

pub struct RecordingDevices {
    input: [VecDeque<u8>; NUM_TERMINALS],
    output: [Vec<u8>; NUM_TERMINALS],
    switches: Vec<(usize, usize)>,
    pub rtc_opens: u32,
    pub rtc_hz: u32,
    pub rtc_waits: u32,
}

impl RecordingDevices {
    pub fn new() -> Self {
        RecordingDevices {
            input: Default::default(),
            output: Default::default(),
            switches: Vec::new(),
            rtc_opens: 0,
            rtc_hz: 0,
            rtc_waits: 0,
        }
    }

    pub fn push_input(&mut self, terminal: TerminalId, bytes: &[u8]) {
        self.input[terminal.index()].extend(bytes.iter().copied());
    }

    pub fn output(&self, terminal: TerminalId) -> &[u8] {
        &self.output[terminal.index()]
    }

    /// show_terminal の (from, to) 履歴
    pub fn switches(&self) -> &[(usize, usize)] {
        &self.switches
    }
}

impl Devices for RecordingDevices {
    fn terminal_read(&mut self, terminal: TerminalId, buf: &mut [u8]) -> Result<usize, KernelError> {
        let input = &mut self.input[terminal.index()];
        let n = buf.len().min(input.len());
        for (dst, src) in buf.iter_mut().zip(input.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn terminal_write(&mut self, terminal: TerminalId, buf: &[u8]) -> Result<usize, KernelError> {
        self.output[terminal.index()].extend_from_slice(buf);
        Ok(buf.len())
    }

    fn rtc_open(&mut self) -> Result<(), KernelError> {
        self.rtc_opens += 1;
        self.rtc_hz = 2;
        Ok(())
    }

    fn rtc_wait(&mut self) -> Result<(), KernelError> {
        self.rtc_waits += 1;
        Ok(())
    }

    fn rtc_set_frequency(&mut self, hz: u32) -> Result<(), KernelError> {
        self.rtc_hz = hz;
        Ok(())
    }

    fn show_terminal(&mut self, from: TerminalId, to: TerminalId) {
        self.switches.push((from.index(), to.index()));
    }
}

//
// KernelState
//

pub type TestKernel = KernelState<SimMachine, RecordingDevices, ReadOnlyFs<'static>>;

/// boot 前のカーネル
pub fn kernel() -> TestKernel {
    let fs = ReadOnlyFs::new(standard_image()).unwrap();
    KernelState::new(
        SimMachine::new(),
        RecordingDevices::new(),
        fs,
        Layout::DEFAULT,
        TimerConfig::DEFAULT,
    )
}

pub fn booted() -> (TestKernel, Transfer) {
    let mut k = kernel();
    let first = k.boot().unwrap();
    (k, first)
}

/// カーネルスタック上の適当な中断文脈
pub fn context(esp: u32) -> SavedContext {
    SavedContext {
        esp,
        ebp: esp + 8,
        esp0: 0,
        ss0: KERNEL_DS,
    }
}
