// kernel/src/kernel/halt.rs
//
// 役割:
// - halt: current プロセスを終わらせ、親の execute を終わらせる（Transfer::Resume）。
//
// やること:
// - fd 2.. を close する。
// - 端末の最後の 1 つなら、空間と PCB を片付けてその端末に shell を起動し直す。
// - そうでなければ親のビデオページ / TSS / 空間を戻し、子の空間と PCB を片付ける。
//
// 設計方針:
// - 途中の片付けに失敗してもログとイベントに残して先に進む。halt は必ずどこかへ制御を渡す。

use crate::arch::gdt::KERNEL_DS;
use crate::arch::Machine;
use crate::config::SHELL;
use crate::fs::FileSystem;
use crate::kernel::devices::Devices;
use crate::kernel::exec::Origin;
use crate::kernel::fd::IoContext;
use crate::kernel::registry::{ProcessId, RunState};
use crate::kernel::terminal::{TerminalId, USER_VIDEO_FLAGS};
use crate::kernel::{KernelState, LogEvent, Transfer};
use crate::logging;
use crate::mem::addr::VirtAddr;
use crate::mem::address_space::AddressSpaceId;

/// 例外で終わったときに親へ渡す status（8bit の終了コードとは重ならない）
pub const EXCEPTION_STATUS: i32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltCause {
    /// halt system call の終了コード
    Exit(u8),
    /// CPU 例外のベクタ番号
    Exception(u8),
}

impl HaltCause {
    pub fn status(self) -> i32 {
        match self {
            HaltCause::Exit(code) => code as i32,
            HaltCause::Exception(_) => EXCEPTION_STATUS,
        }
    }
}

impl<M: Machine, D: Devices, F: FileSystem> KernelState<M, D, F> {
    pub fn halt(&mut self, cause: HaltCause) -> Transfer {
        self.critical(|k| k.halt_locked(cause))
    }

    /// CPU 例外。current が居なければ止まるしかない。
    pub fn exception(&mut self, vector: u8) -> Transfer {
        logging::error("exception: user process faulted");
        logging::info_u64(" vector", vector as u64);

        let Some(pid) = self.registry.current() else {
            logging::error("exception: no current process");
            return Transfer::Idle;
        };
        self.push_event(LogEvent::ExceptionRaised { pid, vector });
        self.halt(HaltCause::Exception(vector))
    }

    fn halt_locked(&mut self, cause: HaltCause) -> Transfer {
        let Some(pid) = self.registry.current() else {
            logging::error("halt: no current process");
            return Transfer::Idle;
        };
        let (terminal, parent, space) = match self.registry.get(pid) {
            Ok(pcb) => (pcb.terminal, pcb.parent, pcb.space),
            Err(e) => {
                logging::error_kv("halt: current process vanished", e.as_str());
                return Transfer::Idle;
            }
        };

        // 1
        self.close_all(pid, terminal);

        let status = cause.status();
        self.push_event(LogEvent::ProcessHalted { pid, status });
        logging::info("halt: process finished");
        logging::info_u64(" pid", pid.slot() as u64);
        logging::info_u64(" status", status as u64);

        let live = self.terminals[terminal.index()].live;
        match parent {
            Some(parent) if live > 1 => self.return_to_parent(pid, parent, terminal, space, status),
            _ => self.retire_last(pid, terminal, space),
        }
    }

    /// 2. 端末の最後のプロセス: 片付けて shell を起動し直す
    fn retire_last(&mut self, pid: ProcessId, terminal: TerminalId, space: Option<AddressSpaceId>) -> Transfer {
        self.machine
            .set_kernel_stack(KERNEL_DS, self.layout.global_kernel_stack);
        if let Err(e) = self.memory.activate(AddressSpaceId::Kernel, &mut self.machine) {
            logging::error_kv("halt: kernel space activation failed", e.as_str());
        }
        if let Some(space) = space {
            self.discard_space(space);
        }
        self.release_pcb(pid);

        let slot = &mut self.terminals[terminal.index()];
        slot.live = slot.live.saturating_sub(1);
        slot.top = None;
        self.registry.set_current(None);

        self.push_event(LogEvent::ShellRelaunched { terminal });
        logging::info("halt: relaunching shell");
        logging::info_u64(" terminal", terminal.index() as u64);

        match self.launch_locked(SHELL, Origin::Kernel { terminal, interrupted: None }) {
            Ok(transfer) => transfer,
            Err(e) => {
                logging::error_kv("halt: shell relaunch failed", e.as_str());
                self.push_event(LogEvent::LaunchFailed { terminal, error: e });
                Transfer::Idle
            }
        }
    }

    /// 3. 親の execute を status で終わらせる
    fn return_to_parent(
        &mut self,
        pid: ProcessId,
        parent: ProcessId,
        terminal: TerminalId,
        space: Option<AddressSpaceId>,
        status: i32,
    ) -> Transfer {
        let (parent_space, context) = match self.registry.get(parent) {
            Ok(p) => match p.state {
                RunState::AwaitingChild { child, context } if child == pid => (p.space, context),
                _ => {
                    logging::error("halt: parent is not waiting for this child");
                    return self.retire_last(pid, terminal, space);
                }
            },
            Err(e) => {
                logging::error_kv("halt: parent missing", e.as_str());
                return self.retire_last(pid, terminal, space);
            }
        };

        let video = VirtAddr(self.layout.video.0);
        let target = self.user_video_target(terminal);
        if let Some(ps) = parent_space {
            if let Err(e) = self.memory.remap(ps, video, target, USER_VIDEO_FLAGS) {
                logging::error_kv("halt: parent video remap failed", e.as_str());
            }
        }

        self.machine.set_kernel_stack(context.ss0, context.esp0);
        let back = parent_space.unwrap_or(AddressSpaceId::Kernel);
        if let Err(e) = self.memory.activate(back, &mut self.machine) {
            logging::error_kv("halt: parent space activation failed", e.as_str());
        }
        if let Some(space) = space {
            self.discard_space(space);
        }

        let slot = &mut self.terminals[terminal.index()];
        slot.top = Some(parent);
        slot.live = slot.live.saturating_sub(1);
        self.release_pcb(pid);

        if let Ok(p) = self.registry.get_mut(parent) {
            p.state = RunState::Running;
        }
        self.registry.set_current(Some(parent));

        self.push_event(LogEvent::ParentResumed { pid: parent, status });
        Transfer::Resume {
            pid: parent,
            context,
            status: Some(status),
        }
    }

    /// fd 2.. を束ねた close で閉じる
    fn close_all(&mut self, pid: ProcessId, terminal: TerminalId) {
        let Ok(pcb) = self.registry.get_mut(pid) else {
            return;
        };
        let mut io = IoContext {
            fs: &self.fs,
            devices: &mut self.devices,
            terminal,
        };
        loop {
            let next_fd = pcb.files.open_user_fds().next();
            let Some(fd) = next_fd else {
                break;
            };
            let Some(mut file) = pcb.files.take(fd) else {
                break;
            };
            let close = file.ops.close;
            if let Err(e) = close(&mut io, &mut file) {
                logging::error_kv("halt: close failed", e.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ring3::SavedContext;
    use crate::kernel::syscall::Syscall;
    use crate::testkit::{booted, context};

    #[test]
    fn status_values() {
        assert_eq!(HaltCause::Exit(0).status(), 0);
        assert_eq!(HaltCause::Exit(255).status(), 255);
        assert_eq!(HaltCause::Exception(14).status(), EXCEPTION_STATUS);
    }

    #[test]
    fn child_halt_resumes_parent_with_status() {
        let (mut k, _) = booted();
        let parent = k.registry().current().unwrap();
        let parent_space = k.registry().get(parent).unwrap().space.unwrap();
        let caller = context(0x007F_FE00);
        let free = k.registry().free_count();
        // execute は呼び出し時点の TSS も一緒に保存する
        let saved = SavedContext {
            esp0: k.registry().get(parent).unwrap().kernel_stack_top,
            ss0: KERNEL_DS,
            ..caller
        };

        let child = match k.execute(b"ls", caller) {
            Transfer::EnterUser { pid, .. } => pid,
            other => panic!("unexpected transfer {:?}", other),
        };
        let child_space = k.registry().get(child).unwrap().space.unwrap();

        // 子が fd を開いたまま終わる
        assert_eq!(
            k.syscall(Syscall::Open(b"frame0.txt"), context(0x7F_FD00)),
            Transfer::Return(2)
        );

        let transfer = k.halt(HaltCause::Exit(7));
        assert_eq!(
            transfer,
            Transfer::Resume { pid: parent, context: saved, status: Some(7) }
        );
        assert_eq!(k.registry().current(), Some(parent));
        assert_eq!(k.registry().get(parent).unwrap().state, RunState::Running);
        assert_eq!(k.registry().free_count(), free);
        assert_eq!(k.memory().active(), parent_space);
        assert!(!k.memory().is_owned(child_space));
        assert_eq!(k.memory().present_entries(child_space), 0);
        assert_eq!(k.machine().kernel_stack(), (KERNEL_DS, saved.esp0));

        let slot = k.terminal(TerminalId::FIRST);
        assert_eq!(slot.top, Some(parent));
        assert_eq!(slot.live, 1);
        assert!(k.check_invariants().is_ok());
    }

    #[test]
    fn child_halting_off_screen_leaves_parent_on_its_buffer() {
        let (mut k, _) = booted();
        let parent = k.registry().current().unwrap();
        let parent_space = k.registry().get(parent).unwrap().space.unwrap();
        k.execute(b"ls", context(0x007F_FE00));

        // 端末 1 を表示している間に端末 0 の子が終わる
        let t1 = TerminalId::new(1).unwrap();
        k.switch_terminal(t1, Some(context(0x007F_FD00)));
        let t1_shell = k.terminal(t1).top.unwrap();

        match k.halt(HaltCause::Exit(0)) {
            Transfer::Resume { pid, .. } => assert_eq!(pid, parent),
            other => panic!("unexpected transfer {:?}", other),
        }
        let video = VirtAddr(0xB8000);
        assert_eq!(
            k.memory().translate(parent_space, video),
            Some(k.layout().video_buffer(0))
        );
        let t1_space = k.registry().get(t1_shell).unwrap().space.unwrap();
        assert_eq!(k.memory().translate(t1_space, video), Some(k.layout().video));
        assert_eq!(k.displayed(), t1);
        assert_eq!(k.machine().cr3(), Some(k.memory().root_of(parent_space).unwrap()));
        assert!(k.check_invariants().is_ok());
    }

    #[test]
    fn teardown_failure_does_not_stop_the_halt() {
        let (mut k, _) = booted();
        let parent = k.registry().current().unwrap();
        k.execute(b"ls", context(0x007F_FE00));
        let child = k.registry().current().unwrap();
        let child_space = k.registry().get(child).unwrap().space.unwrap();

        // 子の空間を先に壊しておく
        k.memory.activate(AddressSpaceId::Kernel, &mut k.machine).unwrap();
        k.memory.teardown(child_space).unwrap();

        match k.halt(HaltCause::Exit(3)) {
            Transfer::Resume { pid, status, .. } => {
                assert_eq!(pid, parent);
                assert_eq!(status, Some(3));
            }
            other => panic!("unexpected transfer {:?}", other),
        }
        assert!(k.events().any(|e| matches!(
            e,
            LogEvent::TeardownFailed {
                error: crate::kernel::KernelError::AddressSpace(
                    crate::mem::address_space::AddressSpaceError::NotOwned
                )
            }
        )));
        assert!(k.registry().get(child).is_err());
        assert_eq!(k.registry().current(), Some(parent));
        assert_eq!(k.terminal(TerminalId::FIRST).live, 1);
    }

    #[test]
    fn exception_delivers_reserved_status() {
        let (mut k, _) = booted();
        let parent = k.registry().current().unwrap();
        k.execute(b"ls", context(0x007F_FE00));
        match k.exception(13) {
            Transfer::Resume { pid, status, .. } => {
                assert_eq!(pid, parent);
                assert_eq!(status, Some(EXCEPTION_STATUS));
            }
            other => panic!("unexpected transfer {:?}", other),
        }
        assert!(k.events().any(|e| matches!(e, LogEvent::ExceptionRaised { vector: 13, .. })));
    }

    #[test]
    fn halting_the_only_process_relaunches_a_shell() {
        let (mut k, _) = booted();
        let old = k.registry().current().unwrap();
        let old_space = k.registry().get(old).unwrap().space.unwrap();

        let transfer = k.halt(HaltCause::Exit(0));
        let shell = match transfer {
            Transfer::EnterUser { pid, .. } => pid,
            other => panic!("unexpected transfer {:?}", other),
        };

        let slot = k.terminal(TerminalId::FIRST);
        assert_eq!(slot.live, 1);
        assert_eq!(slot.top, Some(shell));
        assert_eq!(k.registry().get(shell).unwrap().name.as_bytes(), b"shell");
        assert_eq!(k.registry().get(shell).unwrap().parent, None);
        // 同じ slot が再利用される
        assert_eq!(shell, old);
        assert_eq!(k.memory().active(), old_space);
        assert!(k.events().any(|e| matches!(e, LogEvent::ShellRelaunched { .. })));
        assert!(k.check_invariants().is_ok());
    }

    #[test]
    fn halt_without_current_process_idles() {
        let mut k = crate::testkit::kernel();
        assert_eq!(k.halt(HaltCause::Exit(1)), Transfer::Idle);
        assert_eq!(k.exception(0), Transfer::Idle);
        assert_eq!(k.registry().free_count(), crate::config::MAX_PROCESSES);
    }
}
