// kernel/src/mem/addr.rs
//
// 役割:
// - 物理アドレス / 仮想アドレスに型を付ける（32-bit 保護モード前提）。
// やること:
// - u32 の生アドレス値に対して、「これは物理」「これは仮想」と区別できるようにする。
// - ページディレクトリ / ページテーブルの index 計算をここに寄せる。
// やらないこと:
// - CR3 や PTE を直接触る処理は書かない（それは arch / paging 側で行う）。

use core::fmt;

use crate::mem::layout::{LARGE_PAGE_SIZE, PAGE_SIZE};

/// 物理アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u32);

/// 仮想アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u32);

impl PhysAddr {
    /// 4KiB 境界に揃える。
    pub const fn align_down(self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// 4MiB 境界に揃える。
    pub const fn align_down_large(self) -> PhysAddr {
        PhysAddr(self.0 & !(LARGE_PAGE_SIZE - 1))
    }

    pub const fn offset(self, bytes: u32) -> PhysAddr {
        PhysAddr(self.0.wrapping_add(bytes))
    }

    pub const fn is_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

impl VirtAddr {
    pub const fn align_down(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn offset(self, bytes: u32) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(bytes))
    }

    /// 上位 10bit: ページディレクトリの index
    pub const fn dir_index(self) -> usize {
        ((self.0 & 0xFFC0_0000) >> 22) as usize
    }

    /// 中位 10bit: ページテーブルの index
    pub const fn table_index(self) -> usize {
        ((self.0 & 0x003F_F000) >> 12) as usize
    }

    /// 4MiB 以上は large page で扱う。
    pub const fn is_large_region(self) -> bool {
        self.0 >= LARGE_PAGE_SIZE
    }

    /// 4KiB ページ内オフセット
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// 4MiB ページ内オフセット
    pub const fn large_page_offset(self) -> u32 {
        self.0 & (LARGE_PAGE_SIZE - 1)
    }
}

// --- Debug 実装（ログで見やすくするため） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}
