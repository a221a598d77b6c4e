// kernel/src/arch/gdt.rs
//
// 役割:
// - GDT のセレクタ配置を固定する（カーネル/ユーザの code/data, TSS）。
// - 実機向けに i386 TSS の形を定義する。
//
// やらないこと:
// - GDT 本体の構築とロード（ブートローダ段で済ませる前提）
//
// 設計方針:
// - セレクタ値の組み立ては x86_64 crate の SegmentSelector / PrivilegeLevel に任せる
//   （index << 3 | RPL の計算はアーキ幅に依存しない）。

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

/// 0x10
pub const KERNEL_CS: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
/// 0x18
pub const KERNEL_DS: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring0);
/// 0x23
pub const USER_CS: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);
/// 0x2B
pub const USER_DS: SegmentSelector = SegmentSelector::new(5, PrivilegeLevel::Ring3);
/// 0x30
pub const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(6, PrivilegeLevel::Ring0);

/// i386 のハードウェア TSS（特権遷移で使うのは ss0/esp0 だけ）
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct TaskStateSegment32 {
    pub prev_task_link: u16,
    _r0: u16,
    pub esp0: u32,
    pub ss0: u16,
    _r1: u16,
    pub esp1: u32,
    pub ss1: u16,
    _r2: u16,
    pub esp2: u32,
    pub ss2: u16,
    _r3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _r4: u16,
    pub cs: u16,
    _r5: u16,
    pub ss: u16,
    _r6: u16,
    pub ds: u16,
    _r7: u16,
    pub fs: u16,
    _r8: u16,
    pub gs: u16,
    _r9: u16,
    pub ldt_selector: u16,
    _r10: u16,
    pub debug_trap: u16,
    pub io_map_base: u16,
}

impl TaskStateSegment32 {
    pub const fn new() -> Self {
        TaskStateSegment32 {
            prev_task_link: 0,
            _r0: 0,
            esp0: 0,
            ss0: KERNEL_DS.0,
            _r1: 0,
            esp1: 0,
            ss1: 0,
            _r2: 0,
            esp2: 0,
            ss2: 0,
            _r3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _r4: 0,
            cs: 0,
            _r5: 0,
            ss: 0,
            _r6: 0,
            ds: 0,
            _r7: 0,
            fs: 0,
            _r8: 0,
            gs: 0,
            _r9: 0,
            ldt_selector: 0,
            _r10: 0,
            debug_trap: 0,
            // I/O 許可ビットマップなし
            io_map_base: core::mem::size_of::<TaskStateSegment32>() as u16,
        }
    }
}
