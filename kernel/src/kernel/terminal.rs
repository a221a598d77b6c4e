// kernel/src/kernel/terminal.rs
//
// 役割:
// - 端末ごとの「一番上のプロセス」と生存数、表示端末の切替。
//
// やること:
// - switch_terminal: 画面の入れ替えを通知し、全プロセスのユーザ用ビデオページを付け替える。
//   切替先にプロセスが居なければ shell を起動する。
//
// やらないこと:
// - 画面内容のコピー（Devices::show_terminal の仕事）

use crate::arch::ring3::SavedContext;
use crate::arch::Machine;
use crate::config::{NUM_TERMINALS, SHELL};
use crate::fs::FileSystem;
use crate::kernel::devices::Devices;
use crate::kernel::exec::Origin;
use crate::kernel::registry::ProcessId;
use crate::kernel::{KernelState, LogEvent, Transfer};
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::address_space::AddressSpaceId;
use crate::mem::paging::PageFlags;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TerminalId(usize);

impl TerminalId {
    pub const FIRST: TerminalId = TerminalId(0);

    pub const fn new(index: usize) -> Option<TerminalId> {
        if index < NUM_TERMINALS {
            Some(TerminalId(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0
    }

    pub fn all() -> impl Iterator<Item = TerminalId> {
        (0..NUM_TERMINALS).map(TerminalId)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TerminalSlot {
    pub top: Option<ProcessId>,
    pub live: usize,
}

/// ユーザ用ビデオページの属性
pub(crate) const USER_VIDEO_FLAGS: PageFlags = PageFlags::USER.union(PageFlags::WRITABLE);

impl<M: Machine, D: Devices, F: FileSystem> KernelState<M, D, F> {
    /// 端末 t のプロセスから見た 0xB8000 の実体
    pub(crate) fn user_video_target(&self, terminal: TerminalId) -> PhysAddr {
        if terminal == self.displayed {
            self.layout.video
        } else {
            self.layout.video_buffer(terminal.index())
        }
    }

    /// 表示端末を切り替える（キーボードの Alt+F1..F3）。
    pub fn switch_terminal(&mut self, to: TerminalId, interrupted: Option<SavedContext>) -> Transfer {
        self.critical(|k| k.switch_terminal_locked(to, interrupted))
    }

    fn switch_terminal_locked(&mut self, to: TerminalId, interrupted: Option<SavedContext>) -> Transfer {
        let from = self.displayed;
        if from == to {
            return Transfer::Continue;
        }

        self.devices.show_terminal(from, to);
        self.displayed = to;

        let video = VirtAddr(self.layout.video.0);
        let active = self.memory.active();
        let mut active_changed = false;
        for pcb in self.registry.iter() {
            let space = match pcb.space {
                Some(space @ AddressSpaceId::Process(_)) => space,
                _ => continue,
            };
            let target = if pcb.terminal == to {
                self.layout.video
            } else if pcb.terminal == from {
                self.layout.video_buffer(from.index())
            } else {
                continue;
            };
            match self.memory.remap(space, video, target, USER_VIDEO_FLAGS) {
                Ok(()) => active_changed |= space == active,
                Err(e) => logging::error_kv("switch_terminal: video remap failed", e.as_str()),
            }
        }
        // 走っている空間の古い変換を捨てる（CR3 を積み直して TLB flush）
        if active_changed {
            if let Err(e) = self.memory.activate(active, &mut self.machine) {
                logging::error_kv("switch_terminal: reload failed", e.as_str());
            }
        }

        self.push_event(LogEvent::TerminalSwitched { from, to });
        logging::info("switch_terminal: displayed terminal changed");
        logging::info_u64(" from", from.index() as u64);
        logging::info_u64(" to", to.index() as u64);

        if self.terminals[to.index()].live > 0 {
            return Transfer::Continue;
        }

        match self.launch_locked(SHELL, Origin::Kernel { terminal: to, interrupted }) {
            Ok(transfer) => transfer,
            Err(e) => {
                logging::error_kv("switch_terminal: shell launch failed", e.as_str());
                self.push_event(LogEvent::LaunchFailed { terminal: to, error: e });
                Transfer::Continue
            }
        }
    }
}
