// kernel/src/kernel/sched.rs
//
// 役割:
// - PIT tick ごとの端末単位ラウンドロビン。
//
// やること:
// - 自分以外の端末を (current + 1), (current + 2) の順に見て、生存数が 0 でない最初の端末へ切り替える。
// - 切替先はその端末の top プロセス（Preempted なら文脈へ、Ready なら最初の ring3 入り）。
//
// やらないこと:
// - 資源の確保 / 解放（既に生きているプロセスの間で切り替えるだけ）
// - 端末内の top 以外のプロセスのスケジュール（それらは子の終了待ち）

use crate::arch::gdt::KERNEL_DS;
use crate::arch::ring3::{SavedContext, UserEntry};
use crate::arch::{Machine, PIT_IRQ};
use crate::config::NUM_TERMINALS;
use crate::fs::FileSystem;
use crate::kernel::devices::Devices;
use crate::kernel::registry::{ProcessId, RunState};
use crate::kernel::terminal::TerminalId;
use crate::kernel::{KernelError, KernelState, LogEvent, Transfer};
use crate::logging;

/// current 以外で生存数が 0 でない最初の端末
pub fn next_terminal(live: &[usize; NUM_TERMINALS], current: TerminalId) -> Option<TerminalId> {
    (1..NUM_TERMINALS)
        .map(|i| (current.index() + i) % NUM_TERMINALS)
        .find(|&t| live[t] > 0)
        .and_then(TerminalId::new)
}

/// 切替先がどこから走り出すか
enum Resumption {
    Context(SavedContext),
    Fresh(UserEntry),
}

impl<M: Machine, D: Devices, F: FileSystem> KernelState<M, D, F> {
    /// タイマ割り込み。interrupted は割り込まれたカーネル文脈。
    pub fn timer_tick(&mut self, interrupted: SavedContext) -> Transfer {
        self.critical(|k| k.timer_tick_locked(interrupted))
    }

    fn timer_tick_locked(&mut self, interrupted: SavedContext) -> Transfer {
        self.ticks += 1;

        let current = self.registry.current();
        let from = current
            .and_then(|pid| self.registry.get(pid).ok())
            .map(|pcb| pcb.terminal)
            .unwrap_or(self.displayed);
        let live = self.live_counts();

        let next = match current {
            Some(_) => next_terminal(&live, from),
            // 何も走っていないなら自分の端末も候補
            None if live[from.index()] > 0 => Some(from),
            None => next_terminal(&live, from),
        };

        let transfer = match next.and_then(|t| self.terminals[t.index()].top) {
            None => Transfer::Continue,
            Some(target) => match self.switch_to(target, interrupted) {
                Ok(transfer) => transfer,
                Err(e) => {
                    logging::error_kv("sched: switch failed", e.as_str());
                    Transfer::Continue
                }
            },
        };

        #[cfg(feature = "trace_sched")]
        {
            logging::info("sched: tick");
            logging::info_u64(" from_terminal", from.index() as u64);
            match next {
                Some(t) => logging::info_u64(" to_terminal", t.index() as u64),
                None => logging::info(" to_terminal = none"),
            }
        }

        self.machine.end_of_interrupt(PIT_IRQ);
        transfer
    }

    fn switch_to(&mut self, target: ProcessId, interrupted: SavedContext) -> Result<Transfer, KernelError> {
        let pcb = self.registry.get(target)?;
        let space = pcb.space.ok_or(KernelError::UnknownProcess)?;
        let resumption = match pcb.state {
            RunState::Preempted(ctx) => Resumption::Context(ctx),
            RunState::Ready(entry) => Resumption::Fresh(entry),
            _ => return Err(KernelError::Unsupported),
        };
        let fresh_stack = pcb.kernel_stack_top;

        self.memory.activate(space, &mut self.machine)?;

        let from = self.registry.current();
        self.park_current(Some(interrupted));

        match resumption {
            Resumption::Context(ctx) => self.machine.set_kernel_stack(ctx.ss0, ctx.esp0),
            Resumption::Fresh(_) => self.machine.set_kernel_stack(KERNEL_DS, fresh_stack),
        }
        self.registry.get_mut(target)?.state = RunState::Running;
        self.registry.set_current(Some(target));
        self.push_event(LogEvent::TaskSwitched { from, to: target });

        Ok(match resumption {
            Resumption::Context(context) => Transfer::Resume {
                pid: target,
                context,
                status: None,
            },
            Resumption::Fresh(entry) => Transfer::EnterUser { pid: target, entry },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{booted, context};

    fn t(i: usize) -> TerminalId {
        TerminalId::new(i).unwrap()
    }

    #[test]
    fn next_terminal_skips_current_and_empty() {
        assert_eq!(next_terminal(&[1, 0, 2], t(0)), Some(t(2)));
        assert_eq!(next_terminal(&[0, 0, 0], t(0)), None);
        assert_eq!(next_terminal(&[0, 0, 0], t(2)), None);
        assert_eq!(next_terminal(&[3, 0, 0], t(0)), None);
        assert_eq!(next_terminal(&[1, 1, 1], t(2)), Some(t(0)));
        assert_eq!(next_terminal(&[0, 1, 1], t(0)), Some(t(1)));
    }

    #[test]
    fn ticks_rotate_through_terminals() {
        let (mut k, _) = booted();
        let shell0 = k.terminal(t(0)).top.unwrap();
        let shell1 = k.terminal(t(1)).top.unwrap();
        let shell2 = k.terminal(t(2)).top.unwrap();

        // 端末 1 の shell はまだ一度も走っていない
        let ctx0 = context(0x007F_F000);
        match k.timer_tick(ctx0) {
            Transfer::EnterUser { pid, .. } => assert_eq!(pid, shell1),
            other => panic!("unexpected transfer {:?}", other),
        }
        assert!(matches!(
            k.registry().get(shell0).unwrap().state,
            RunState::Preempted(c) if c.esp == ctx0.esp
        ));
        assert_eq!(k.registry().current(), Some(shell1));
        let space1 = k.registry().get(shell1).unwrap().space.unwrap();
        assert_eq!(k.memory().active(), space1);
        assert_eq!(
            k.machine().kernel_stack().1,
            k.registry().get(shell1).unwrap().kernel_stack_top
        );

        match k.timer_tick(context(0x007F_D000)) {
            Transfer::EnterUser { pid, .. } => assert_eq!(pid, shell2),
            other => panic!("unexpected transfer {:?}", other),
        }

        // 一周して端末 0 は保存した文脈に戻る
        match k.timer_tick(context(0x007F_B000)) {
            Transfer::Resume { pid, context, status } => {
                assert_eq!(pid, shell0);
                assert_eq!(context.esp, ctx0.esp);
                assert_eq!(status, None);
            }
            other => panic!("unexpected transfer {:?}", other),
        }
        assert_eq!(k.machine().eoi_count(PIT_IRQ), 3);
        assert!(k.events().filter(|e| matches!(e, LogEvent::TaskSwitched { .. })).count() >= 3);
        assert!(k.check_invariants().is_ok());
    }

    #[test]
    fn lone_terminal_keeps_running() {
        let mut k = crate::testkit::kernel();
        assert_eq!(k.timer_tick(context(0x7F_F000)), Transfer::Continue);
        assert_eq!(k.machine().eoi_count(PIT_IRQ), 1);

        let (mut k, _) = booted();
        k.force_empty_terminal(t(1));
        k.force_empty_terminal(t(2));
        let running = k.registry().current();
        assert_eq!(k.timer_tick(context(0x7F_F000)), Transfer::Continue);
        assert_eq!(k.registry().current(), running);
        assert_eq!(
            k.registry().get(running.unwrap()).unwrap().state,
            RunState::Running
        );
    }

    #[test]
    fn switch_only_touches_top_processes() {
        let (mut k, _) = booted();
        let shell0 = k.registry().current().unwrap();
        // 端末 0 で子を起動すると shell0 は子待ち
        let child = match k.execute(b"ls", context(0x007F_FE00)) {
            Transfer::EnterUser { pid, .. } => pid,
            other => panic!("unexpected transfer {:?}", other),
        };
        k.timer_tick(context(0x007F_F000));
        k.timer_tick(context(0x007F_D000));
        match k.timer_tick(context(0x007F_B000)) {
            Transfer::Resume { pid, .. } => assert_eq!(pid, child),
            other => panic!("unexpected transfer {:?}", other),
        }
        assert!(matches!(
            k.registry().get(shell0).unwrap().state,
            RunState::AwaitingChild { .. }
        ));
        assert!(k.check_invariants().is_ok());
    }
}
