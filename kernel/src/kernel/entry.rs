// kernel/src/kernel/entry.rs
//
// termos: kernel entry glue（i386 実機）
//
// 役割:
// - ブート段から KernelState を受け取り、boot して最初のユーザプロセスへ入る。
// - 割り込み / int 0x80 の asm スタブから呼ばれる extern "C" の入口。
//
// やること:
// - Transfer を実際の遷移（iret / 保存文脈への復帰 / hlt）に直す。
// - system call のユーザバッファをプログラム窓の中に収まるか確かめてからスライスにする。
//
// やらないこと:
// - GDT / IDT / PIC 初期化（ブート段の仕事）
// - 判断そのもの（それは KernelState の責務）

use crate::arch::gdt::KERNEL_DS;
use crate::arch::i386::BareMetal;
use crate::arch::ring3::{enter_user_mode_iret, resume_context, SavedContext};
use crate::arch::{self, cpu};
use crate::fs::FileSystem;
use crate::kernel::devices::Devices;
use crate::kernel::state_ref::{register_kernel, with_kernel};
use crate::kernel::{KernelState, TerminalId, Transfer};
use crate::logging;
use crate::mem::addr::PhysAddr;

/// 本体エントリ。ks はブート段が static に置いたもの。
pub fn run<D, F>(ks: &'static mut KernelState<BareMetal, D, F>) -> !
where
    D: Devices + 'static,
    F: FileSystem + 'static,
{
    logging::init();
    logging::info("kernel::run()");

    // arena の本当の物理配置（カーネル領域は identity）
    let placement = PhysAddr(ks.memory() as *const _ as u32);
    ks.memory_mut().set_placement(placement);
    logging::info_hex(" paging_arena", placement.0 as u64);

    let first = match ks.boot() {
        Ok(transfer) => transfer,
        Err(e) => {
            logging::error_kv("boot failed", e.as_str());
            ks.dump_events();
            arch::halt_loop();
        }
    };
    register_kernel(ks);

    complete(first);
    logging::error("first transfer returned");
    arch::halt_loop()
}

/// Transfer を実行する。Return / Continue のときだけ戻り、呼び出し元へ返す値になる。
fn complete(transfer: Transfer) -> i32 {
    match transfer {
        Transfer::Return(value) => value,
        Transfer::Continue => 0,
        Transfer::EnterUser { entry, .. } => {
            // Safety: 遷移先の空間と TSS は KernelState が整えてある
            unsafe { enter_user_mode_iret(&entry) }
        }
        Transfer::Resume { context, status, .. } => unsafe {
            resume_context(&context, status.unwrap_or(0))
        },
        Transfer::Idle => {
            cpu::enable_interrupts();
            arch::halt_loop()
        }
    }
}

/// 割り込まれたカーネル文脈（TSS 側は KernelState が埋める）。
/// フレームが壊れていたら戻る先が無いので止める。
fn interrupted(esp: u32, ebp: u32) -> SavedContext {
    match SavedContext::from_stub_frame(esp, ebp, KERNEL_DS) {
        Some(ctx) => ctx,
        None => {
            logging::error("entry: malformed stub frame");
            logging::info_hex(" esp", esp as u64);
            logging::info_hex(" ebp", ebp as u64);
            arch::halt_loop()
        }
    }
}

//
// asm スタブとの約束（どの入口も同じ）
//
// - スタブは `push ebp; mov ebp, esp` の直後の esp / ebp を末尾 2 引数で渡す（cdecl）。
// - 戻り値があれば eax。スタブは eax を壊さずに `leave; ret` / iret へ進むこと。
// - 呼び出しは IF=0 のまま行う（with_kernel の中で割り込まれない）。
// - 別のプロセスへ遷移した場合は戻ってこない。後で resume_context が
//   保存した ebp のフレームから同じ場所へ戻す。
//

/// IRQ0。EOI は on_timer が送る。
#[no_mangle]
pub extern "C" fn termos_timer_entry(esp: u32, ebp: u32) {
    if let Some(transfer) = with_kernel(|k| k.on_timer(interrupted(esp, ebp))) {
        complete(transfer);
    }
}

/// int 0x80。number = eax, arg = ebx, ptr / len = ecx / edx（ユーザ側の値）。
/// 戻り値はそのままユーザの eax になる。
#[no_mangle]
pub extern "C" fn termos_syscall_entry(number: u32, arg: u32, ptr: u32, len: u32, esp: u32, ebp: u32) -> i32 {
    let transfer = with_kernel(|k| {
        let layout = k.layout();
        let end = ptr.checked_add(len);
        let bytes: &mut [u8] = match end {
            _ if len == 0 => &mut [],
            Some(end) if layout.in_program_window(ptr) && end <= layout.program_window_end() => {
                // Safety: 範囲は有効化中のプロセスのプログラム窓の中
                unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) }
            }
            _ => return Transfer::Return(-1),
        };
        k.on_syscall(number, arg, bytes, interrupted(esp, ebp))
    });
    match transfer {
        Some(transfer) => complete(transfer),
        None => -1,
    }
}

/// CPU 例外。文脈は保存しない（例外を出したプロセスへは戻らない）。
#[no_mangle]
pub extern "C" fn termos_exception_entry(vector: u32) {
    match with_kernel(|k| k.on_exception(vector as u8)) {
        Some(transfer) => {
            complete(transfer);
        }
        None => {
            logging::error("exception before kernel registration");
            arch::halt_loop();
        }
    }
}

/// キーボードドライバが Alt+F1..F3 を見つけたら呼ぶ
#[no_mangle]
pub extern "C" fn termos_terminal_switch_entry(to: u32, esp: u32, ebp: u32) {
    let Some(to) = TerminalId::new(to as usize) else {
        return;
    };
    if let Some(transfer) = with_kernel(|k| k.on_terminal_switch(to, interrupted(esp, ebp))) {
        complete(transfer);
    }
}
