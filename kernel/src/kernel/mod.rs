// kernel/src/kernel/mod.rs
//
// termos: 3 端末を持つ保護モードカーネルのプロセス / 仮想メモリ core
//
// - KernelState: 空間 arena（MemoryManager）+ PCB arena（Registry）+ 端末 slot + イベントログ
// - execute / halt / timer_tick / switch_terminal / syscall は、次に CPU が
//   どこへ行くかを Transfer で返す（スタックを直接すり替えない）
//
// [設計上の不変条件（check_invariants() が検証する）]
//
// 1. 端末 t の live は、terminal == t の PCB の数に等しい。
//    live > 0 なら top は Some で、その PCB は端末 t に居て子待ちではない。
// 2. current が Some なら、その PCB は Running。Running な PCB は高々 1 つ。
// 3. 生きている PCB は slot と同じ番号の Process 空間を所有している。
//    所有されている Process 空間には必ず PCB が居る。
// 4. parent が Some なら、親は生きていて AwaitingChild { child: 自分 }。
// 5. current が None なら、有効な空間は Kernel。

pub mod command;
pub mod devices;
pub mod error;
pub mod exec;
pub mod fd;
pub mod halt;
pub mod registry;
pub mod sched;
pub mod state_ref;
pub mod syscall;
pub mod terminal;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod entry;

pub use error::KernelError;
pub use halt::HaltCause;
pub use registry::{ProcessId, RunState};
pub use syscall::Syscall;
pub use terminal::{TerminalId, TerminalSlot};

use crate::arch::gdt::KERNEL_DS;
use crate::arch::ring3::{SavedContext, UserEntry};
use crate::arch::{Machine, PIT_IRQ};
use crate::config::{Layout, TimerConfig, MAX_PROCESSES, NUM_TERMINALS, SHELL};
use crate::fs::FileSystem;
use crate::logging;
use crate::mem::address_space::{AddressSpaceId, MemoryManager};
use crate::mem::layout::{LARGE_PAGE_SIZE, PAGE_SIZE};
use devices::Devices;
use exec::Origin;
use registry::Registry;

const EVENT_LOG_CAP: usize = 256;

//
// ──────────────────────────────────────────────
// Transfer（次に CPU が行く先）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// system call の戻り値（呼び出し元へそのまま戻る）
    Return(i32),
    /// 割り込まれた文脈にそのまま戻る
    Continue,
    /// ring3 へ初めて入る
    EnterUser { pid: ProcessId, entry: UserEntry },
    /// 保存しておいたカーネル文脈へ戻る。status は親の execute の戻り値
    Resume {
        pid: ProcessId,
        context: SavedContext,
        status: Option<i32>,
    },
    /// 走らせるものが無い（割り込みを待って止まる）
    Idle,
}

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    ProcessLaunched {
        pid: ProcessId,
        terminal: TerminalId,
        parent: Option<ProcessId>,
    },
    LaunchFailed { terminal: TerminalId, error: KernelError },
    ProcessHalted { pid: ProcessId, status: i32 },
    ShellRelaunched { terminal: TerminalId },
    ParentResumed { pid: ProcessId, status: i32 },
    TaskSwitched { from: Option<ProcessId>, to: ProcessId },
    TerminalSwitched { from: TerminalId, to: TerminalId },
    TeardownFailed { error: KernelError },
    ExceptionRaised { pid: ProcessId, vector: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvariantViolation(pub &'static str);

//
// ──────────────────────────────────────────────
// KernelState（OS全体の状態）
// ──────────────────────────────────────────────
//

pub struct KernelState<M: Machine, D: Devices, F: FileSystem> {
    machine: M,
    devices: D,
    fs: F,
    layout: Layout,
    timer: TimerConfig,

    memory: MemoryManager,
    registry: Registry,

    terminals: [TerminalSlot; NUM_TERMINALS],
    displayed: TerminalId,
    ticks: u64,

    event_log: [Option<LogEvent>; EVENT_LOG_CAP],
    event_log_len: usize,
}


impl<M: Machine, D: Devices, F: FileSystem> KernelState<M, D, F> {
    pub fn new(machine: M, devices: D, fs: F, layout: Layout, timer: TimerConfig) -> Self {
        KernelState {
            machine,
            devices,
            fs,
            layout,
            timer,
            memory: MemoryManager::new(layout.paging_arena),
            registry: Registry::new(layout),
            terminals: [TerminalSlot::default(); NUM_TERMINALS],
            displayed: TerminalId::FIRST,
            ticks: 0,
            event_log: [None; EVENT_LOG_CAP],
            event_log_len: 0,
        }
    }

    //
    // boot
    //

    /// カーネル空間を作って有効にし、PIT を設定して、各端末に shell を起動する。
    /// 端末 0 の shell への Transfer を返す（他は Ready のまま待つ）。
    pub fn boot(&mut self) -> Result<Transfer, KernelError> {
        logging::info("boot: start");
        self.layout.validate()?;
        let pit = self.timer.program()?;

        let layout = self.layout;
        self.memory
            .enable_identity_range(layout.video, layout.video.offset(PAGE_SIZE));
        self.memory.enable_identity_range(
            layout.video_buffer(0),
            layout.video_buffer(NUM_TERMINALS),
        );
        self.memory.enable_identity_range(
            layout.kernel_region,
            layout.kernel_region.offset(LARGE_PAGE_SIZE),
        );
        self.memory
            .activate(AddressSpaceId::Kernel, &mut self.machine)?;
        self.machine
            .set_kernel_stack(KERNEL_DS, layout.global_kernel_stack);

        self.machine.program_timer(pit);
        self.machine.set_irq_mask(PIT_IRQ, false);
        logging::info_u64(" timer_hz", self.timer.hz as u64);

        #[cfg(feature = "evil_double_map")]
        self.evil_double_map();

        let mut first = Transfer::Idle;
        for terminal in (0..NUM_TERMINALS).rev().filter_map(TerminalId::new) {
            first = self.launch(SHELL, Origin::Kernel { terminal, interrupted: None })?;
        }

        logging::info("boot: shells launched");
        self.check_invariants()?;
        Ok(first)
    }

    /// 同じページを二重に map して MappingConflict になることを確かめる
    #[cfg(feature = "evil_double_map")]
    fn evil_double_map(&mut self) {
        use crate::mem::addr::VirtAddr;
        use crate::mem::address_space::AddressSpaceError;
        use crate::mem::paging::PageFlags;

        let region = self.layout.kernel_region;
        match self
            .memory
            .map(AddressSpaceId::Kernel, VirtAddr(region.0), region, PageFlags::WRITABLE)
        {
            Err(AddressSpaceError::MappingConflict) => {
                logging::info("evil_double_map: MappingConflict observed (expected)")
            }
            Ok(()) => logging::error("evil_double_map: second map was accepted"),
            Err(e) => logging::error_kv("evil_double_map: unexpected error", e.as_str()),
        }
    }

    //
    // 割り込み禁止区間
    //

    /// 割り込みを止めて f を実行し、元の状態に戻す。
    pub(crate) fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was_enabled = self.machine.interrupts_enabled();
        self.machine.disable_interrupts();
        let r = f(self);
        if was_enabled {
            self.machine.enable_interrupts();
        }
        r
    }

    //
    // 参照系
    //

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// 実機で static に置いた後の arena 物理配置の付け替え用
    pub(crate) fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn devices(&self) -> &D {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut D {
        &mut self.devices
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.registry.current()
    }

    pub fn displayed(&self) -> TerminalId {
        self.displayed
    }

    pub fn terminal(&self, t: TerminalId) -> TerminalSlot {
        self.terminals[t.index()]
    }

    pub fn live_counts(&self) -> [usize; NUM_TERMINALS] {
        let mut live = [0; NUM_TERMINALS];
        for (i, slot) in self.terminals.iter().enumerate() {
            live[i] = slot.live;
        }
        live
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    //
    // イベントログ
    //

    fn push_event(&mut self, ev: LogEvent) {
        if self.event_log_len < EVENT_LOG_CAP {
            self.event_log[self.event_log_len] = Some(ev);
            self.event_log_len += 1;
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &LogEvent> + '_ {
        self.event_log[..self.event_log_len].iter().flatten()
    }

    pub fn dump_events(&self) {
        logging::info("=== KernelState Event Log Dump ===");
        for ev in self.events() {
            log_event(*ev);
        }
        logging::info("=== End of Event Log ===");

        logging::info("=== Process Dump ===");
        for pcb in self.registry.iter() {
            logging::info(" Process:");
            logging::info_u64("  pid", pcb.pid.slot() as u64);
            logging::info_u64("  terminal", pcb.terminal.index() as u64);
            match pcb.parent {
                Some(p) => logging::info_u64("  parent", p.slot() as u64),
                None => logging::info("  parent = None"),
            }
            match pcb.state {
                RunState::Launching => logging::info("  state = Launching"),
                RunState::Ready(_) => logging::info("  state = Ready"),
                RunState::Running => logging::info("  state = Running"),
                RunState::Preempted(_) => logging::info("  state = Preempted"),
                RunState::AwaitingChild { .. } => logging::info("  state = AwaitingChild"),
            }
            if let Some(space) = pcb.space {
                logging::info_u64("  mappings", self.memory.mapping_count(space) as u64);
            }
        }
        logging::info("=== End of Process Dump ===");
    }

    //
    // 不変条件チェック
    //

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let result = self.find_violation();
        if let Err(v) = result {
            logging::error_kv("INVARIANT VIOLATION", v.0);
        }
        result
    }

    fn find_violation(&self) -> Result<(), InvariantViolation> {
        let mut per_terminal = [0usize; NUM_TERMINALS];
        let mut running = 0;

        for pcb in self.registry.iter() {
            per_terminal[pcb.terminal.index()] += 1;

            // 3
            match pcb.space {
                Some(space @ AddressSpaceId::Process(slot))
                    if slot == pcb.pid.slot() && self.memory.is_owned(space) => {}
                _ => return Err(InvariantViolation("process does not own its address space")),
            }

            match pcb.state {
                RunState::Running => running += 1,
                RunState::Launching => return Err(InvariantViolation("process left half launched")),
                _ => {}
            }

            // 4
            if let Some(parent) = pcb.parent {
                let p = self
                    .registry
                    .get(parent)
                    .map_err(|_| InvariantViolation("parent is not live"))?;
                match p.state {
                    RunState::AwaitingChild { child, .. } if child == pcb.pid => {}
                    _ => return Err(InvariantViolation("parent is not waiting for its child")),
                }
            }
        }

        for slot in 0..MAX_PROCESSES {
            let owned = self.memory.is_owned(AddressSpaceId::Process(slot));
            let occupied = self.registry.iter().any(|p| p.pid.slot() == slot);
            if owned != occupied {
                return Err(InvariantViolation("address space ownership does not match registry"));
            }
        }

        // 1
        for t in TerminalId::all() {
            let slot = self.terminals[t.index()];
            if slot.live != per_terminal[t.index()] {
                return Err(InvariantViolation("live count does not match processes on terminal"));
            }
            match slot.top {
                Some(top) => {
                    let pcb = self
                        .registry
                        .get(top)
                        .map_err(|_| InvariantViolation("top process is not live"))?;
                    if pcb.terminal != t {
                        return Err(InvariantViolation("top process is on another terminal"));
                    }
                    if matches!(pcb.state, RunState::AwaitingChild { .. }) {
                        return Err(InvariantViolation("top process is waiting for a child"));
                    }
                }
                None if slot.live > 0 => {
                    return Err(InvariantViolation("terminal has processes but no top"));
                }
                None => {}
            }
        }

        // 2, 5
        match self.registry.current() {
            Some(pid) => {
                let pcb = self
                    .registry
                    .get(pid)
                    .map_err(|_| InvariantViolation("current process is not live"))?;
                if pcb.state != RunState::Running || running != 1 {
                    return Err(InvariantViolation("current process is not the one running"));
                }
            }
            None => {
                if running != 0 {
                    return Err(InvariantViolation("running process is not current"));
                }
                if self.memory.active() != AddressSpaceId::Kernel {
                    return Err(InvariantViolation("process space active with no current process"));
                }
            }
        }
        Ok(())
    }

    /// 端末 t のプロセスをまとめて消す（テストで空の端末を作る用）
    #[cfg(test)]
    pub(crate) fn force_empty_terminal(&mut self, t: TerminalId) {
        let victims: std::vec::Vec<ProcessId> = self
            .registry
            .iter()
            .filter(|p| p.terminal == t)
            .map(|p| p.pid)
            .collect();
        for pid in victims {
            if let Ok(Some(space)) = self.registry.get(pid).map(|p| p.space) {
                self.discard_space(space);
            }
            self.release_pcb(pid);
        }
        self.terminals[t.index()] = TerminalSlot::default();
    }
}

fn log_event(ev: LogEvent) {
    match ev {
        LogEvent::ProcessLaunched { pid, terminal, parent } => {
            logging::info("EV: ProcessLaunched");
            logging::info_u64(" pid", pid.slot() as u64);
            logging::info_u64(" terminal", terminal.index() as u64);
            if let Some(p) = parent {
                logging::info_u64(" parent", p.slot() as u64);
            }
        }
        LogEvent::LaunchFailed { terminal, error } => {
            logging::info("EV: LaunchFailed");
            logging::info_u64(" terminal", terminal.index() as u64);
            logging::info(error.as_str());
        }
        LogEvent::ProcessHalted { pid, status } => {
            logging::info("EV: ProcessHalted");
            logging::info_u64(" pid", pid.slot() as u64);
            logging::info_u64(" status", status as u64);
        }
        LogEvent::ShellRelaunched { terminal } => {
            logging::info("EV: ShellRelaunched");
            logging::info_u64(" terminal", terminal.index() as u64);
        }
        LogEvent::ParentResumed { pid, status } => {
            logging::info("EV: ParentResumed");
            logging::info_u64(" pid", pid.slot() as u64);
            logging::info_u64(" status", status as u64);
        }
        LogEvent::TaskSwitched { from, to } => {
            logging::info("EV: TaskSwitched");
            if let Some(f) = from {
                logging::info_u64(" from", f.slot() as u64);
            }
            logging::info_u64(" to", to.slot() as u64);
        }
        LogEvent::TerminalSwitched { from, to } => {
            logging::info("EV: TerminalSwitched");
            logging::info_u64(" from", from.index() as u64);
            logging::info_u64(" to", to.index() as u64);
        }
        LogEvent::TeardownFailed { error } => {
            logging::info("EV: TeardownFailed");
            logging::info(error.as_str());
        }
        LogEvent::ExceptionRaised { pid, vector } => {
            logging::info("EV: ExceptionRaised");
            logging::info_u64(" pid", pid.slot() as u64);
            logging::info_u64(" vector", vector as u64);
        }
    }
}
