// kernel/src/arch/ring3.rs
//
// 役割:
// - ring0 から ring3 へ入る文脈（UserEntry）と、
//   中断したカーネル文脈（SavedContext）を値として表現する。
//
// やること:
// - iret フレームに積む値（eip / cs / eflags / esp / ss）と ds をまとめる。
// - 実機では enter_user_mode_iret / resume_context で実際に遷移する。
//
// やらないこと:
// - 遷移の判断（それは kernel 側の Transfer が決める）
//
// 設計方針:
// - core は「どこへ遷移するか」を値で返すだけにして、asm はここに閉じ込める。

use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::SegmentSelector;

use crate::arch::gdt::{USER_CS, USER_DS};

/// eflags の bit1 は常に 1（予約ビット）
const EFLAGS_RESERVED: u32 = 1 << 1;

/// ring3 用の eflags（IF=1）
#[inline(always)]
pub fn user_eflags() -> u32 {
    RFlags::INTERRUPT_FLAG.bits() as u32 | EFLAGS_RESERVED
}

/// ring3 へ入るときの初期文脈
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserEntry {
    pub eip: u32,
    pub esp: u32,
    pub cs: SegmentSelector,
    pub ss: SegmentSelector,
    pub ds: SegmentSelector,
    pub eflags: u32,
}

impl UserEntry {
    pub fn new(eip: u32, esp: u32) -> Self {
        UserEntry {
            eip,
            esp,
            cs: USER_CS,
            ss: USER_DS,
            ds: USER_DS,
            eflags: user_eflags(),
        }
    }
}

/// 中断したカーネル文脈。プロセスが止まっている間だけ意味を持つ。
///
/// esp / ebp は入口スタブ（割り込み / int 0x80）が `push ebp; mov ebp, esp` で
/// 作ったフレームの値:
///
/// ```text
///   [ebp + 4]  スタブの続き（戻り先）
///   [ebp]      スタブ呼び出し前の ebp
///   esp        そのフレーム内（esp <= ebp）
/// ```
///
/// resume_context は `leave; ret` でこのフレームを畳み、スタブの続きへ戻る。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedContext {
    pub esp: u32,
    pub ebp: u32,
    /// 中断時点の TSS.esp0
    pub esp0: u32,
    /// 中断時点の TSS.ss0
    pub ss0: SegmentSelector,
}

impl SavedContext {
    /// 入口スタブから渡された esp / ebp を文脈にする。TSS 側は KernelState が埋める。
    /// フレームの形になっていなければ None（戻る先が無い）。
    pub fn from_stub_frame(esp: u32, ebp: u32, ss0: SegmentSelector) -> Option<Self> {
        let aligned = esp & 3 == 0 && ebp & 3 == 0;
        // [ebp + 4] の戻り先まで読めること
        if !aligned || ebp < esp || ebp.checked_add(8).is_none() {
            return None;
        }
        Some(SavedContext { esp, ebp, esp0: 0, ss0 })
    }
}

/// ring3 へ遷移する（戻らない）。
///
/// # Safety
/// - entry.eip / entry.esp が有効化済みのユーザ空間を指していること
/// - TSS.esp0 がこのプロセスのカーネルスタックを指していること
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn enter_user_mode_iret(entry: &UserEntry) -> ! {
    let ds = entry.ds.0 as u32;

    core::arch::asm!(
        "mov ds, {ds:x}",
        "mov es, {ds:x}",
        "mov fs, {ds:x}",
        "mov gs, {ds:x}",
        // iret フレーム: SS, ESP, EFLAGS, CS, EIP
        "push {ss}",
        "push {esp}",
        "push {eflags}",
        "push {cs}",
        "push {eip}",
        "iretd",
        ds = in(reg) ds,
        ss = in(reg) entry.ss.0 as u32,
        esp = in(reg) entry.esp,
        eflags = in(reg) entry.eflags,
        cs = in(reg) entry.cs.0 as u32,
        eip = in(reg) entry.eip,
        options(noreturn)
    );
}

/// 保存しておいたカーネル文脈へ戻る（戻らない）。
/// value は中断していた呼び出し（execute など）の戻り値として eax に入る。
///
/// esp は leave で ebp に置き換わるので、実際に効くのは ctx.ebp のフレーム。
///
/// # Safety
/// - ctx は過去にこのカーネルで保存した文脈で、そのスタックがまだ生きていること
/// - ctx.ebp が SavedContext に書いたフレームを指していること
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn resume_context(ctx: &SavedContext, value: i32) -> ! {
    core::arch::asm!(
        "mov esp, {esp}",
        "mov ebp, {ebp}",
        "leave",
        "ret",
        esp = in(reg) ctx.esp,
        ebp = in(reg) ctx.ebp,
        in("eax") value,
        options(noreturn)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_entry_uses_ring3_selectors_and_if() {
        let e = UserEntry::new(0x0804_80E8, 0x083F_FFFC);
        assert_eq!(e.cs.0, 0x23);
        assert_eq!(e.ss.0, 0x2B);
        assert_eq!(e.ds.0, 0x2B);
        assert_eq!(e.eflags, 0x202);
    }

    #[test]
    fn stub_frames_must_sit_above_esp() {
        use crate::arch::gdt::KERNEL_DS;

        let ctx = SavedContext::from_stub_frame(0x007F_FE00, 0x007F_FE08, KERNEL_DS).unwrap();
        assert_eq!((ctx.esp, ctx.ebp, ctx.esp0), (0x007F_FE00, 0x007F_FE08, 0));
        assert_eq!(ctx.ss0, KERNEL_DS);

        // ebp == esp（ローカル無し）は有効
        assert!(SavedContext::from_stub_frame(0x1000, 0x1000, KERNEL_DS).is_some());
        // フレームが esp より下 / 境界ずれ / 戻り先がアドレス空間の外
        assert_eq!(SavedContext::from_stub_frame(0x1000, 0x0FF8, KERNEL_DS), None);
        assert_eq!(SavedContext::from_stub_frame(0x1000, 0x1002, KERNEL_DS), None);
        assert_eq!(SavedContext::from_stub_frame(0x1001, 0x1008, KERNEL_DS), None);
        assert_eq!(SavedContext::from_stub_frame(0xFFFF_FFF0, 0xFFFF_FFFC, KERNEL_DS), None);
    }
}
