// kernel/src/mem/paging.rs
//
// PDE / PTE のビット表現と、1024 エントリのテーブル型。
// - エントリは「全ビット 0（不在）」か「完全に構築済み」のどちらか。
//   途中まで作ったエントリは存在しない（Entry::new でまとめて作る）。

use crate::mem::addr::PhysAddr;
use crate::mem::layout::{BASE_MASK, ENTRY_COUNT, LARGE_BASE_MASK};

bitflags::bitflags! {
    /// PDE / PTE の属性ビット（i386）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        /// ユーザ空間からアクセス可能
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// PDE のみ: 4MiB large page
        const LARGE = 1 << 7;
        /// CR3 切替で TLB から落とさない
        const GLOBAL = 1 << 8;
    }
}

/// 呼び出し側が map/remap に渡してよい属性。
/// PRESENT / LARGE は mem 側が付ける。
pub const CALLER_FLAGS: PageFlags = PageFlags::WRITABLE
    .union(PageFlags::USER)
    .union(PageFlags::WRITE_THROUGH)
    .union(PageFlags::CACHE_DISABLE)
    .union(PageFlags::GLOBAL);

/// PDE / PTE 共通の 32-bit エントリ
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry(u32);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    /// 4KiB ページ（または page table へのリンク）
    pub fn new(base: PhysAddr, flags: PageFlags) -> Entry {
        Entry((base.0 & BASE_MASK) | (flags | PageFlags::PRESENT).bits())
    }

    /// 4MiB large page（PDE 専用）
    pub fn new_large(base: PhysAddr, flags: PageFlags) -> Entry {
        Entry((base.0 & LARGE_BASE_MASK) | (flags | PageFlags::PRESENT | PageFlags::LARGE).bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn is_large(self) -> bool {
        self.flags().contains(PageFlags::LARGE)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !BASE_MASK)
    }

    pub fn base(self) -> PhysAddr {
        if self.is_large() {
            PhysAddr(self.0 & LARGE_BASE_MASK)
        } else {
            PhysAddr(self.0 & BASE_MASK)
        }
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Entry({:#010x})", self.0)
    }
}

/// ページディレクトリ（CR3 が指す 4KiB 境界のテーブル）
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageDirectory {
    pub entries: [Entry; ENTRY_COUNT],
}

/// ページテーブル（4MiB 未満の 4KiB 単位マッピング）
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    pub entries: [Entry; ENTRY_COUNT],
}

impl PageDirectory {
    pub const fn new() -> Self {
        PageDirectory { entries: [Entry::EMPTY; ENTRY_COUNT] }
    }

    pub fn clear(&mut self) {
        self.entries = [Entry::EMPTY; ENTRY_COUNT];
    }

    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

impl PageTable {
    pub const fn new() -> Self {
        PageTable { entries: [Entry::EMPTY; ENTRY_COUNT] }
    }

    pub fn clear(&mut self) {
        self.entries = [Entry::EMPTY; ENTRY_COUNT];
    }

    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_entry_keeps_only_4m_base() {
        let e = Entry::new_large(PhysAddr(0x00C1_2345), PageFlags::WRITABLE | PageFlags::USER);
        assert!(e.is_present());
        assert!(e.is_large());
        assert_eq!(e.base(), PhysAddr(0x00C0_0000));
        assert_eq!(e.bits(), 0x00C0_0000 | 0x87);
    }

    #[test]
    fn small_entry_layout() {
        let e = Entry::new(PhysAddr(0xB8000), PageFlags::WRITABLE | PageFlags::GLOBAL);
        assert_eq!(e.bits(), 0xB8000 | 0x103);
        assert!(!e.is_large());
        assert_eq!(e.base(), PhysAddr(0xB8000));
        assert!(!Entry::EMPTY.is_present());
    }
}
