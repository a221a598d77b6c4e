// kernel/src/kernel/exec.rs
//
// 役割:
// - execute: コマンド行から子プロセスを作り、ring3 への遷移（Transfer::EnterUser）を返す。
//
// 手順（この順番を崩さない。失敗したらその呼び出しで積んだものだけ戻す）:
//   1. 空コマンドを弾いてから PCB を取る
//   2. name / 引数に分ける                       失敗 → PCB 解放
//   3. 実行ファイルを探してヘッダを検査する       失敗 → PCB 解放
//   4. アドレス空間を作る                         失敗 → 空間破棄 + PCB 解放
//   5. 新空間を有効にしてイメージを流し込む       失敗 → 元の空間に戻す + 空間破棄 + PCB 解放
//   6. 親（呼び出し元）を AwaitingChild にする
//   7. TSS を子のカーネルスタックにして、端末の top / 生存数 / current を更新
//
// やらないこと:
// - 実際の iret（arch::ring3 が Transfer を受けて行う）

use crate::arch::gdt::KERNEL_DS;
use crate::arch::ring3::{SavedContext, UserEntry};
use crate::arch::Machine;
use crate::config::{Layout, LOADER_CHUNK};
use crate::fs::{FileSystem, FileType, FsError};
use crate::kernel::command;
use crate::kernel::devices::Devices;
use crate::kernel::registry::{ProcessId, RunState};
use crate::kernel::terminal::{TerminalId, USER_VIDEO_FLAGS};
use crate::kernel::{KernelError, KernelState, LogEvent, Transfer};
use crate::logging;
use crate::mem::addr::VirtAddr;
use crate::mem::address_space::{AddressSpaceError, AddressSpaceId};
use crate::mem::paging::PageFlags;

/// 実行ファイルヘッダの大きさ
pub const HEADER_LEN: usize = 40;
pub const EXEC_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// entry（little endian u32）の位置
const ENTRY_OFFSET: usize = 24;

/// 誰の代わりに起動するか
#[derive(Clone, Copy, Debug)]
pub(crate) enum Origin {
    /// execute system call。呼び出し元が親になる
    Process { pid: ProcessId, context: SavedContext },
    /// boot / shell 再起動 / 端末切替。interrupted は止めたプロセスの文脈
    Kernel {
        terminal: TerminalId,
        interrupted: Option<SavedContext>,
    },
}

/// ヘッダを検査して entry を返す
pub fn parse_header(header: &[u8], layout: &Layout) -> Result<u32, KernelError> {
    if header.len() < HEADER_LEN || header[..EXEC_MAGIC.len()] != EXEC_MAGIC {
        return Err(KernelError::ExecutableMalformed);
    }
    let raw = &header[ENTRY_OFFSET..ENTRY_OFFSET + 4];
    let entry = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if !layout.in_program_window(entry) {
        return Err(KernelError::ExecutableMalformed);
    }
    Ok(entry)
}

impl<M: Machine, D: Devices, F: FileSystem> KernelState<M, D, F> {
    /// execute system call。失敗したら呼び出し元はそのまま -1 を受け取る。
    pub fn execute(&mut self, command: &[u8], caller: SavedContext) -> Transfer {
        let pid = match self.registry.current() {
            Some(pid) => pid,
            None => {
                logging::error("execute: no current process");
                return Transfer::Return(KernelError::SENTINEL);
            }
        };

        match self.launch(command, Origin::Process { pid, context: caller }) {
            Ok(transfer) => transfer,
            Err(e) => {
                logging::error_kv("execute: failed", e.as_str());
                if let Ok(pcb) = self.registry.get(pid) {
                    let terminal = pcb.terminal;
                    self.push_event(LogEvent::LaunchFailed { terminal, error: e });
                }
                Transfer::Return(KernelError::SENTINEL)
            }
        }
    }

    pub(crate) fn launch(&mut self, command: &[u8], origin: Origin) -> Result<Transfer, KernelError> {
        self.critical(|k| k.launch_locked(command, origin))
    }

    /// 割り込み禁止区間の中から呼ぶこと
    pub(crate) fn launch_locked(&mut self, command: &[u8], origin: Origin) -> Result<Transfer, KernelError> {
        let terminal = match origin {
            Origin::Process { pid, .. } => self.registry.get(pid)?.terminal,
            Origin::Kernel { terminal, .. } => terminal,
        };

        // 1
        if command::trim_nul(command).is_empty() {
            return Err(KernelError::InvalidCommand);
        }
        let pid = self.registry.allocate()?;

        // 2..5
        let entry = match self.prepare(pid, terminal, command) {
            Ok(entry) => entry,
            Err(e) => {
                self.release_pcb(pid);
                return Err(e);
            }
        };

        // 6
        let parent = match origin {
            Origin::Process { pid: caller, context } => {
                let (ss0, esp0) = self.machine.kernel_stack();
                let context = SavedContext { esp0, ss0, ..context };
                self.registry.get_mut(caller)?.state = RunState::AwaitingChild { child: pid, context };
                Some(caller)
            }
            Origin::Kernel { interrupted, .. } => {
                self.park_current(interrupted);
                None
            }
        };

        // 7
        let pcb = self.registry.get_mut(pid)?;
        pcb.parent = parent;
        pcb.state = RunState::Running;
        let esp0 = pcb.kernel_stack_top;
        self.machine.set_kernel_stack(KERNEL_DS, esp0);

        let slot = &mut self.terminals[terminal.index()];
        slot.top = Some(pid);
        slot.live += 1;
        self.registry.set_current(Some(pid));

        self.push_event(LogEvent::ProcessLaunched { pid, terminal, parent });
        logging::info("execute: launched");
        logging::info_u64(" pid", pid.slot() as u64);
        logging::info_u64(" terminal", terminal.index() as u64);
        logging::info_hex(" entry", entry.eip as u64);

        Ok(Transfer::EnterUser { pid, entry })
    }

    /// 手順 2..5。PCB の解放は呼び出し側。
    fn prepare(&mut self, pid: ProcessId, terminal: TerminalId, command: &[u8]) -> Result<UserEntry, KernelError> {
        let parsed = command::parse(command)?;
        {
            let pcb = self.registry.get_mut(pid)?;
            pcb.name = parsed.name;
            pcb.args = parsed.args;
            pcb.terminal = terminal;
        }

        let (inode, eip) = self.validate_executable(parsed.name.as_bytes())?;
        let space = self.build_space(pid.slot(), terminal)?;

        let previous = self.memory.active();
        let loaded = match self.memory.activate(space, &mut self.machine) {
            Ok(()) => self.load_image(space, inode),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = loaded {
            if let Err(restore) = self.memory.activate(previous, &mut self.machine) {
                logging::error_kv("execute: could not restore address space", restore.as_str());
            }
            self.discard_space(space);
            return Err(e);
        }

        let entry = UserEntry::new(eip, self.layout.user_stack_top());
        let pcb = self.registry.get_mut(pid)?;
        pcb.space = Some(space);
        pcb.entry = Some(entry);
        Ok(entry)
    }

    /// (inode, entry) を返す
    fn validate_executable(&self, name: &[u8]) -> Result<(u32, u32), KernelError> {
        let dentry = self
            .fs
            .lookup(name)
            .map_err(|_| KernelError::ExecutableNotFound)?;
        if dentry.file_type != FileType::Regular {
            return Err(KernelError::ExecutableMalformed);
        }

        let mut header = [0u8; HEADER_LEN];
        let n = self
            .fs
            .read_data(dentry.inode, 0, &mut header)
            .map_err(|_| KernelError::ExecutableMalformed)?;
        let eip = parse_header(&header[..n], &self.layout)?;
        Ok((dentry.inode, eip))
    }

    fn build_space(&mut self, slot: usize, terminal: TerminalId) -> Result<AddressSpaceId, KernelError> {
        let space = self.memory.claim(slot)?;
        if let Err(e) = self.populate_space(space, slot, terminal) {
            self.discard_space(space);
            return Err(e.into());
        }
        Ok(space)
    }

    fn populate_space(
        &mut self,
        space: AddressSpaceId,
        slot: usize,
        terminal: TerminalId,
    ) -> Result<(), AddressSpaceError> {
        let layout = self.layout;
        self.memory.map(
            space,
            layout.program_window,
            layout.program_phys(slot),
            PageFlags::USER | PageFlags::WRITABLE,
        )?;
        self.memory.map(
            space,
            VirtAddr(layout.kernel_region.0),
            layout.kernel_region,
            PageFlags::WRITABLE | PageFlags::GLOBAL,
        )?;

        let video = self.user_video_target(terminal);
        self.memory.map(space, VirtAddr(layout.video.0), video, USER_VIDEO_FLAGS)?;

        for t in TerminalId::all() {
            let buffer = layout.video_buffer(t.index());
            self.memory.map(space, VirtAddr(buffer.0), buffer, PageFlags::WRITABLE)?;
        }
        Ok(())
    }

    /// 有効化済みの space にファイルを LOADER_CHUNK ずつ書き込む
    fn load_image(&mut self, space: AddressSpaceId, inode: u32) -> Result<(), KernelError> {
        let len = self.fs.file_len(inode)?;
        let room = self.layout.program_window_end() - self.layout.load_address.0;
        if len > room {
            return Err(KernelError::ExecutableMalformed);
        }

        let mut chunk = [0u8; LOADER_CHUNK];
        let mut offset = 0u32;
        while offset < len {
            let n = self.fs.read_data(inode, offset, &mut chunk)?;
            if n == 0 {
                return Err(KernelError::Fs(FsError::Corrupt));
            }
            let dst = self.layout.load_address.offset(offset);
            let phys = self
                .memory
                .translate(space, dst)
                .ok_or(KernelError::MappingAbsent)?;
            self.machine.copy_to_user(dst, phys, &chunk[..n]);
            offset += n as u32;
        }
        Ok(())
    }

    /// 走っていたプロセスを止める（kernel 起点の起動 / 切替用）
    pub(crate) fn park_current(&mut self, interrupted: Option<SavedContext>) {
        let Some(current) = self.registry.current() else {
            return;
        };
        let (ss0, esp0) = self.machine.kernel_stack();
        let Ok(pcb) = self.registry.get_mut(current) else {
            return;
        };
        if pcb.state != RunState::Running {
            return;
        }
        pcb.state = match (interrupted, pcb.entry) {
            (Some(ctx), _) => RunState::Preempted(SavedContext { esp0, ss0, ..ctx }),
            // 一度も ring3 に入っていない（boot で続けて起動した shell）
            (None, Some(entry)) => RunState::Ready(entry),
            (None, None) => {
                logging::warn("park: running process without entry or context");
                return;
            }
        };
        self.registry.set_current(None);
    }

    pub(crate) fn release_pcb(&mut self, pid: ProcessId) {
        if let Err(e) = self.registry.destroy(pid) {
            logging::error_kv("registry: destroy failed", e.as_str());
        }
    }

    pub(crate) fn discard_space(&mut self, space: AddressSpaceId) {
        if let Err(e) = self.memory.teardown(space) {
            logging::error_kv("mem: teardown failed", e.as_str());
            self.push_event(LogEvent::TeardownFailed { error: e.into() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_PROCESSES;
    use crate::mem::addr::PhysAddr;
    use crate::testkit::{booted, context, program, TestKernel, SHELL_ENTRY};

    fn run_execute(k: &mut TestKernel, command: &[u8]) -> Transfer {
        k.execute(command, context(0x007F_FE00))
    }

    #[test]
    fn header_checks() {
        let layout = Layout::DEFAULT;
        let good = program(0x0804_80E8, 64);
        assert_eq!(parse_header(&good, &layout), Ok(0x0804_80E8));

        let mut bad_magic = good.clone();
        bad_magic[1] = b'X';
        assert_eq!(parse_header(&bad_magic, &layout), Err(KernelError::ExecutableMalformed));

        assert_eq!(
            parse_header(&program(0x0840_0000, 64), &layout),
            Err(KernelError::ExecutableMalformed)
        );
        assert_eq!(
            parse_header(&program(0x07FF_FFFF, 64), &layout),
            Err(KernelError::ExecutableMalformed)
        );
        assert_eq!(parse_header(&good[..39], &layout), Err(KernelError::ExecutableMalformed));
    }

    #[test]
    fn execute_builds_the_child_and_parks_the_caller() {
        let (mut k, _) = booted();
        let parent = k.registry().current().unwrap();
        let before = k.terminal(TerminalId::FIRST);

        let transfer = run_execute(&mut k, b"ls\0");
        let (child, entry) = match transfer {
            Transfer::EnterUser { pid, entry } => (pid, entry),
            other => panic!("unexpected transfer {:?}", other),
        };

        assert_eq!(entry.esp, 0x083F_FFFC);
        assert_eq!(entry.cs.0, 0x23);
        assert_eq!(k.registry().current(), Some(child));
        let pcb = k.registry().get(child).unwrap();
        assert_eq!(pcb.parent, Some(parent));
        assert_eq!(pcb.name.as_bytes(), b"ls");
        assert_eq!(pcb.terminal, TerminalId::FIRST);
        assert!(matches!(
            k.registry().get(parent).unwrap().state,
            RunState::AwaitingChild { child: c, .. } if c == child
        ));

        let slot = k.terminal(TerminalId::FIRST);
        assert_eq!(slot.top, Some(child));
        assert_eq!(slot.live, before.live + 1);

        // 空間の中身
        let space = pcb.space.unwrap();
        assert_eq!(k.memory().active(), space);
        assert_eq!(
            k.memory().translate(space, VirtAddr(0x0804_8000)),
            Some(k.layout().program_phys(child.slot()).offset(0x48000))
        );
        assert_eq!(
            k.memory().translate(space, VirtAddr(0x0040_1234)),
            Some(PhysAddr(0x0040_1234))
        );
        assert_eq!(
            k.memory().translate(space, VirtAddr(0xB8000)),
            Some(PhysAddr(0xB8000))
        );
        assert_eq!(k.machine().kernel_stack(), (KERNEL_DS, pcb.kernel_stack_top));
        assert!(k.check_invariants().is_ok());
    }

    #[test]
    fn image_is_streamed_in_chunks_to_the_load_address() {
        let (mut k, _) = booted();
        k.machine_mut().clear_copies();

        let transfer = run_execute(&mut k, b"counter");
        let child = match transfer {
            Transfer::EnterUser { pid, .. } => pid,
            other => panic!("unexpected transfer {:?}", other),
        };
        let image = k.fs().lookup(b"counter").unwrap();
        let len = k.fs().file_len(image.inode).unwrap() as usize;

        let copies: std::vec::Vec<_> = k.machine().copies().copied().collect();
        assert_eq!(copies.len(), (len + LOADER_CHUNK - 1) / LOADER_CHUNK);
        assert_eq!(copies[0].virt, VirtAddr(0x0804_8000));
        assert_eq!(copies[1].virt, VirtAddr(0x0804_8000 + LOADER_CHUNK as u32));
        assert!(copies.iter().all(|c| c.len <= LOADER_CHUNK));
        assert_eq!(
            copies[0].phys,
            k.layout().program_phys(child.slot()).offset(0x48000)
        );
        assert_eq!(k.machine().bytes_copied(), len);

        // 中身もそのまま届いている
        let mut body = std::vec![0u8; len];
        assert_eq!(k.fs().read_data(image.inode, 0, &mut body), Ok(len));
        assert_eq!(k.machine().copied_checksum(), crate::arch::sim::checksum(&body));
    }

    #[test]
    fn failures_return_sentinel_and_release_everything() {
        let (mut k, _) = booted();
        let free = k.registry().free_count();
        let parent = k.registry().current().unwrap();
        let active = k.memory().active();

        for cmd in [
            &b"nosuchprogram"[..],
            b"frame0.txt",
            b"badmagic",
            b"farentry",
            b"short",
            b"huge",
            b"rtc",
            b"",
            b"\0ls",
            b" ls",
        ] {
            assert_eq!(run_execute(&mut k, cmd), Transfer::Return(-1));
            assert_eq!(k.registry().free_count(), free);
            assert_eq!(k.registry().current(), Some(parent));
            assert_eq!(k.registry().get(parent).unwrap().state, RunState::Running);
            assert_eq!(k.memory().active(), active);
        }
        // 使われなかった slot の空間は全部空
        for slot in 0..MAX_PROCESSES {
            let space = AddressSpaceId::Process(slot);
            if !k.memory().is_owned(space) {
                assert_eq!(k.memory().present_entries(space), 0);
            }
        }
        assert!(k.check_invariants().is_ok());
    }

    #[test]
    fn registry_exhaustion_is_reported() {
        let (mut k, _) = booted();
        // boot で 3 つ。残り 3 つを ls で埋める
        while k.registry().free_count() > 0 {
            assert!(matches!(run_execute(&mut k, b"ls"), Transfer::EnterUser { .. }));
        }
        assert_eq!(run_execute(&mut k, b"ls"), Transfer::Return(-1));
        assert!(k.events().any(|e| matches!(
            e,
            LogEvent::LaunchFailed { error: KernelError::RegistryExhausted, .. }
        )));
        assert!(k.check_invariants().is_ok());
    }

    #[test]
    fn shell_entry_point() {
        let (k, first) = booted();
        match first {
            Transfer::EnterUser { entry, .. } => assert_eq!(entry.eip, SHELL_ENTRY),
            other => panic!("unexpected transfer {:?}", other),
        }
        assert_eq!(k.registry().live_count(), 3);
    }
}
