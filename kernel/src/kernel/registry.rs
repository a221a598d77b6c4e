// kernel/src/kernel/registry.rs
//
// 役割:
// - PCB の固定長 arena（MAX_PROCESSES slot）。
//
// やること:
// - allocate / destroy / 参照。pid は slot 番号そのもの。
// - slot から PCB の配置とカーネルスタック上端を決める（8MiB から 8KiB ずつ下へ）。
// - current（今走っているプロセス）を明示的に持つ。
//
// やらないこと:
// - アドレス空間の構築 / 破棄（exec / halt が MemoryManager に頼む）
//
// 設計方針:
// - 保存文脈は RunState の中にだけ置く（止まっている間しか存在しない）。

use core::fmt;

use crate::arch::ring3::{SavedContext, UserEntry};
use crate::config::{Layout, MAX_PROCESSES};
use crate::kernel::command::{CommandArgs, CommandName};
use crate::kernel::fd::FileTable;
use crate::kernel::terminal::TerminalId;
use crate::kernel::KernelError;
use crate::mem::address_space::AddressSpaceId;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(usize);

impl ProcessId {
    pub fn slot(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// PCB を取っただけで、まだ起動途中
    Launching,
    /// 起動済みだが一度も ring3 に入っていない
    Ready(UserEntry),
    Running,
    /// タイマや端末切替で止められた
    Preempted(SavedContext),
    /// execute で子を待っている。子の halt で context に戻る
    AwaitingChild { child: ProcessId, context: SavedContext },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pcb {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub space: Option<AddressSpaceId>,
    pub state: RunState,
    pub files: FileTable,
    pub terminal: TerminalId,
    pub name: CommandName,
    pub args: CommandArgs,
    /// 最初に ring3 へ入る文脈（Ready に戻すとき用）
    pub entry: Option<UserEntry>,
    /// この PCB の物理配置
    pub address: u32,
    pub kernel_stack_top: u32,
}

impl Pcb {
    fn new(pid: ProcessId, layout: &Layout) -> Pcb {
        Pcb {
            pid,
            parent: None,
            space: None,
            state: RunState::Launching,
            files: FileTable::with_std_streams(),
            terminal: TerminalId::FIRST,
            name: CommandName::EMPTY,
            args: CommandArgs::EMPTY,
            entry: None,
            address: layout.pcb_address(pid.slot()),
            kernel_stack_top: layout.kernel_stack_top(pid.slot()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registry {
    layout: Layout,
    slots: [Option<Pcb>; MAX_PROCESSES],
    current: Option<ProcessId>,
}

impl Registry {
    pub fn new(layout: Layout) -> Self {
        Registry {
            layout,
            slots: [None; MAX_PROCESSES],
            current: None,
        }
    }

    /// 一番小さい空き slot を取る
    pub fn allocate(&mut self) -> Result<ProcessId, KernelError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::RegistryExhausted)?;
        let pid = ProcessId(slot);
        self.slots[slot] = Some(Pcb::new(pid, &self.layout));
        Ok(pid)
    }

    pub fn get(&self, pid: ProcessId) -> Result<&Pcb, KernelError> {
        self.slots
            .get(pid.0)
            .and_then(|s| s.as_ref())
            .ok_or(KernelError::UnknownProcess)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Result<&mut Pcb, KernelError> {
        self.slots
            .get_mut(pid.0)
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::UnknownProcess)
    }

    /// pid を持つ PCB の slot を線形に探す
    pub fn index_of(&self, pid: ProcessId) -> Result<usize, KernelError> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(p) if p.pid == pid))
            .ok_or(KernelError::UnknownProcess)
    }

    pub fn destroy(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        let index = self.index_of(pid)?;
        self.slots[index] = None;
        if self.current == Some(pid) {
            self.current = None;
        }
        Ok(())
    }

    pub fn find_free_descriptor(&self, pid: ProcessId) -> Result<usize, KernelError> {
        self.get(pid)?
            .files
            .find_free()
            .ok_or(KernelError::DescriptorExhausted)
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    pub fn set_current(&mut self, pid: Option<ProcessId>) {
        self.current = pid;
    }

    /// カーネルスタック上のアドレスから持ち主を引く（8KiB 境界で切る）
    pub fn owner_of_stack(&self, esp: u32) -> Option<ProcessId> {
        let size = self.layout.kernel_stack_size;
        let end = self.layout.kernel_stack_region_end;
        if esp >= end {
            return None;
        }
        let base = esp & !(size - 1);
        let slot = ((end - base) / size).checked_sub(1)? as usize;
        let pcb = self.slots.get(slot)?.as_ref()?;
        Some(pcb.pid)
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    pub fn live_count(&self) -> usize {
        MAX_PROCESSES - self.free_count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().flatten()
    }
}
