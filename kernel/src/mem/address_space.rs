// kernel/src/mem/address_space.rs
//
// 役割:
// - カーネル identity 空間と、プロセスごとのアドレス空間（PD + 低位 PT）を持つ arena。
// - どの仮想ページがどの物理アドレスにどの権限でマップされているかを実エントリで保持する。
//
// 設計方針:
// - 空間は AddressSpaceId（Kernel / Process(slot)）で指す。生ポインタは外に出さない。
// - Process(slot) の slot は PCB の slot と同じ番号（1 PCB が 1 空間を専有する）。
// - 4MiB 未満は PT 経由（4KiB）、4MiB 以上は PDE に large page を直接置く。
// - map は上書きしない。remap は既存エントリだけを書き換える。
//   個別の unmap は無く、解除は teardown（空間ごと全消去）だけ。
//
// やらないこと:
// - demand paging / swap
// - 物理フレームの動的確保（PT は slot ごとに 1 枚を静的に持つ）

use core::fmt;

use crate::arch::Machine;
use crate::config::MAX_PROCESSES;
use crate::logging;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::layout::{LARGE_PAGE_BOUNDARY, LARGE_PAGE_SIZE, PAGE_SIZE};
use crate::mem::paging::{Entry, PageDirectory, PageFlags, PageTable, CALLER_FLAGS};

/// 空間を指すハンドル
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceId {
    /// 予約済みのカーネル identity 空間
    Kernel,
    /// slot 番号の PCB が所有するプロセス空間
    Process(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// すでに present なエントリへ map しようとした
    MappingConflict,
    /// present でないエントリを remap しようとした
    MappingAbsent,
    /// 所有者のいない空間（未 claim / teardown 済み）を操作しようとした
    NotOwned,
    /// すでに所有者がいる slot を claim しようとした
    AlreadyOwned,
    /// カーネル空間は teardown できない
    KernelSpace,
    /// 有効中の空間は teardown できない
    ActiveSpace,
    BadSlot,
}

impl AddressSpaceError {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressSpaceError::MappingConflict => "mapping conflict",
            AddressSpaceError::MappingAbsent => "mapping absent",
            AddressSpaceError::NotOwned => "address space not owned",
            AddressSpaceError::AlreadyOwned => "address space already owned",
            AddressSpaceError::KernelSpace => "kernel address space",
            AddressSpaceError::ActiveSpace => "address space is active",
            AddressSpaceError::BadSlot => "bad address space slot",
        }
    }
}

impl fmt::Display for AddressSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const EMPTY_DIR: PageDirectory = PageDirectory::new();
const EMPTY_TABLE: PageTable = PageTable::new();

/// identity 範囲を 4MiB 境界で分けた結果 (small, large)
fn split_identity_range(start: u32, end: u32) -> (Option<(u32, u32)>, Option<(u32, u32)>) {
    if start >= end {
        return (None, None);
    }
    let small = if start < LARGE_PAGE_BOUNDARY {
        Some((start, end.min(LARGE_PAGE_BOUNDARY)))
    } else {
        None
    };
    let large = if end > LARGE_PAGE_BOUNDARY {
        Some((start.max(LARGE_PAGE_BOUNDARY), end))
    } else {
        None
    };
    (small, large)
}

pub struct MemoryManager {
    kernel_dir: PageDirectory,
    kernel_table: PageTable,
    dirs: [PageDirectory; MAX_PROCESSES],
    tables: [PageTable; MAX_PROCESSES],
    owned: [bool; MAX_PROCESSES],
    active: AddressSpaceId,
    /// この構造体自身の物理配置（PDE に書く PT / CR3 に書く PD の物理アドレス計算用）
    placement: PhysAddr,
}

impl MemoryManager {
    pub const fn new(placement: PhysAddr) -> Self {
        MemoryManager {
            kernel_dir: EMPTY_DIR,
            kernel_table: EMPTY_TABLE,
            dirs: [EMPTY_DIR; MAX_PROCESSES],
            tables: [EMPTY_TABLE; MAX_PROCESSES],
            owned: [false; MAX_PROCESSES],
            active: AddressSpaceId::Kernel,
            placement,
        }
    }

    /// 実機で static に置いたあと、本当の物理配置を教える。
    /// 何もリンクしていない（boot 前の）状態でだけ呼ぶこと。
    pub fn set_placement(&mut self, placement: PhysAddr) {
        self.placement = placement;
    }

    pub fn active(&self) -> AddressSpaceId {
        self.active
    }

    pub fn is_owned(&self, space: AddressSpaceId) -> bool {
        match space {
            AddressSpaceId::Kernel => true,
            AddressSpaceId::Process(slot) => self.owned.get(slot).copied().unwrap_or(false),
        }
    }

    //
    // 物理アドレス計算
    //

    fn phys_of<T>(&self, obj: &T) -> PhysAddr {
        let offset = obj as *const T as usize - self as *const Self as usize;
        self.placement.offset(offset as u32)
    }

    /// CR3 に入れる値
    pub fn root_of(&self, space: AddressSpaceId) -> Result<PhysAddr, AddressSpaceError> {
        match space {
            AddressSpaceId::Kernel => Ok(self.phys_of(&self.kernel_dir)),
            AddressSpaceId::Process(slot) => {
                self.check_owned(slot)?;
                Ok(self.phys_of(&self.dirs[slot]))
            }
        }
    }

    fn check_owned(&self, slot: usize) -> Result<(), AddressSpaceError> {
        match self.owned.get(slot) {
            None => Err(AddressSpaceError::BadSlot),
            Some(false) => Err(AddressSpaceError::NotOwned),
            Some(true) => Ok(()),
        }
    }

    //
    // enable_identity_range
    //

    /// [start, end) をカーネル空間に identity / global / RW で入れる。
    /// 4MiB 未満は 4KiB、以上は 4MiB 粒度。start >= end は何もしない。
    pub fn enable_identity_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let (small, large) = split_identity_range(start.0, end.0);
        let flags = PageFlags::WRITABLE | PageFlags::GLOBAL;

        if let Some((s, e)) = small {
            self.link_table(AddressSpaceId::Kernel);
            let mut page = (s & !(PAGE_SIZE - 1)) as u64;
            while page < e as u64 {
                let addr = PhysAddr(page as u32);
                self.kernel_table.entries[VirtAddr(addr.0).table_index()] = Entry::new(addr, flags);
                page += PAGE_SIZE as u64;
            }
        }

        if let Some((s, e)) = large {
            let mut page = (s & !(LARGE_PAGE_SIZE - 1)) as u64;
            while page < e as u64 {
                let addr = PhysAddr(page as u32);
                self.kernel_dir.entries[VirtAddr(addr.0).dir_index()] = Entry::new_large(addr, flags);
                page += LARGE_PAGE_SIZE as u64;
            }
        }

        logging::info("mem: identity range enabled");
        logging::info_hex(" start", start.0 as u64);
        logging::info_hex(" end", end.0 as u64);
    }

    //
    // claim / map / remap / teardown
    //

    /// slot の空の空間を PCB に渡す。
    pub fn claim(&mut self, slot: usize) -> Result<AddressSpaceId, AddressSpaceError> {
        match self.owned.get(slot) {
            None => Err(AddressSpaceError::BadSlot),
            Some(true) => Err(AddressSpaceError::AlreadyOwned),
            Some(false) => {
                self.owned[slot] = true;
                Ok(AddressSpaceId::Process(slot))
            }
        }
    }

    /// 低位 PT を PDE[0] にリンクする（未リンク時のみ）
    fn link_table(&mut self, space: AddressSpaceId) {
        let (link_flags, table_phys) = match space {
            AddressSpaceId::Kernel => (PageFlags::WRITABLE, self.phys_of(&self.kernel_table)),
            // PTE 側で USER を絞るので、リンク自体は USER を許しておく
            AddressSpaceId::Process(slot) => (
                PageFlags::WRITABLE | PageFlags::USER,
                self.phys_of(&self.tables[slot]),
            ),
        };
        let dir = match space {
            AddressSpaceId::Kernel => &mut self.kernel_dir,
            AddressSpaceId::Process(slot) => &mut self.dirs[slot],
        };
        if !dir.entries[0].is_present() {
            dir.entries[0] = Entry::new(table_phys, link_flags);
        }
    }

    fn check_space(&self, space: AddressSpaceId) -> Result<(), AddressSpaceError> {
        match space {
            AddressSpaceId::Kernel => Ok(()),
            AddressSpaceId::Process(slot) => self.check_owned(slot),
        }
    }

    /// 1 ページ分のマッピングを入れる。すでに present なら MappingConflict（上書きしない）。
    pub fn map(
        &mut self,
        space: AddressSpaceId,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        self.check_space(space)?;
        let flags = flags & CALLER_FLAGS;

        if virt.is_large_region() {
            let slot = &mut self.dir_mut(space).entries[virt.dir_index()];
            if slot.is_present() {
                return Err(AddressSpaceError::MappingConflict);
            }
            *slot = Entry::new_large(phys, flags);
        } else {
            if self.table_mut(space).entries[virt.table_index()].is_present() {
                return Err(AddressSpaceError::MappingConflict);
            }
            self.link_table(space);
            self.table_mut(space).entries[virt.table_index()] = Entry::new(phys, flags);
        }

        #[cfg(feature = "trace_paging")]
        {
            logging::info("mem: map");
            logging::info_hex(" virt", virt.0 as u64);
            logging::info_hex(" phys", phys.0 as u64);
            logging::info_hex(" flags", flags.bits() as u64);
        }

        Ok(())
    }

    /// 既存マッピングの物理ベースと属性を差し替える。無ければ MappingAbsent。
    pub fn remap(
        &mut self,
        space: AddressSpaceId,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        self.check_space(space)?;
        let flags = flags & CALLER_FLAGS;

        if virt.is_large_region() {
            let slot = &mut self.dir_mut(space).entries[virt.dir_index()];
            if !slot.is_present() {
                return Err(AddressSpaceError::MappingAbsent);
            }
            *slot = Entry::new_large(phys, flags);
        } else {
            if !self.dir(space).entries[0].is_present() {
                return Err(AddressSpaceError::MappingAbsent);
            }
            let slot = &mut self.table_mut(space).entries[virt.table_index()];
            if !slot.is_present() {
                return Err(AddressSpaceError::MappingAbsent);
            }
            *slot = Entry::new(phys, flags);
        }
        Ok(())
    }

    /// 空間を CR3 にロードする。
    pub fn activate<M: Machine>(
        &mut self,
        space: AddressSpaceId,
        machine: &mut M,
    ) -> Result<(), AddressSpaceError> {
        let root = self.root_of(space)?;
        machine.load_page_directory(root);
        self.active = space;
        Ok(())
    }

    /// PD / PT の全エントリを 0 にして slot を返す。
    pub fn teardown(&mut self, space: AddressSpaceId) -> Result<(), AddressSpaceError> {
        let slot = match space {
            AddressSpaceId::Kernel => return Err(AddressSpaceError::KernelSpace),
            AddressSpaceId::Process(slot) => slot,
        };
        self.check_owned(slot)?;
        if self.active == space {
            return Err(AddressSpaceError::ActiveSpace);
        }

        self.dirs[slot].clear();
        self.tables[slot].clear();
        self.owned[slot] = false;
        Ok(())
    }

    //
    // 参照系
    //

    /// 現在のエントリから仮想 → 物理を引く。
    pub fn translate(&self, space: AddressSpaceId, virt: VirtAddr) -> Option<PhysAddr> {
        self.check_space(space).ok()?;
        let pde = self.dir(space).entries[virt.dir_index()];
        if !pde.is_present() {
            return None;
        }
        if pde.is_large() {
            return Some(pde.base().offset(virt.large_page_offset()));
        }
        let pte = self.table(space).entries[virt.table_index()];
        if !pte.is_present() {
            return None;
        }
        Some(pte.base().offset(virt.page_offset()))
    }

    /// 末端エントリ（large PDE か PTE）
    pub fn leaf_entry(&self, space: AddressSpaceId, virt: VirtAddr) -> Option<Entry> {
        self.check_space(space).ok()?;
        let pde = self.dir(space).entries[virt.dir_index()];
        if !pde.is_present() {
            return None;
        }
        if pde.is_large() {
            return Some(pde);
        }
        let pte = self.table(space).entries[virt.table_index()];
        if pte.is_present() {
            Some(pte)
        } else {
            None
        }
    }

    /// present な末端マッピング数（PT へのリンク PDE は数えない）
    pub fn mapping_count(&self, space: AddressSpaceId) -> usize {
        if self.check_space(space).is_err() {
            return 0;
        }
        let dir = self.dir(space);
        let large = dir.entries.iter().filter(|e| e.is_present() && e.is_large()).count();
        let small = if dir.entries[0].is_present() && !dir.entries[0].is_large() {
            self.table(space).present_count()
        } else {
            0
        };
        large + small
    }

    /// PD と PT のうち present なエントリ総数（teardown 検証用）
    pub fn present_entries(&self, space: AddressSpaceId) -> usize {
        match space {
            AddressSpaceId::Kernel => {
                self.kernel_dir.present_count() + self.kernel_table.present_count()
            }
            AddressSpaceId::Process(slot) => match (self.dirs.get(slot), self.tables.get(slot)) {
                (Some(d), Some(t)) => d.present_count() + t.present_count(),
                _ => 0,
            },
        }
    }

    fn dir(&self, space: AddressSpaceId) -> &PageDirectory {
        match space {
            AddressSpaceId::Kernel => &self.kernel_dir,
            AddressSpaceId::Process(slot) => &self.dirs[slot],
        }
    }

    fn dir_mut(&mut self, space: AddressSpaceId) -> &mut PageDirectory {
        match space {
            AddressSpaceId::Kernel => &mut self.kernel_dir,
            AddressSpaceId::Process(slot) => &mut self.dirs[slot],
        }
    }

    fn table(&self, space: AddressSpaceId) -> &PageTable {
        match space {
            AddressSpaceId::Kernel => &self.kernel_table,
            AddressSpaceId::Process(slot) => &self.tables[slot],
        }
    }

    fn table_mut(&mut self, space: AddressSpaceId) -> &mut PageTable {
        match space {
            AddressSpaceId::Kernel => &mut self.kernel_table,
            AddressSpaceId::Process(slot) => &mut self.tables[slot],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimMachine;

    const ARENA: PhysAddr = PhysAddr(0x0060_0000);

    fn manager() -> Box<MemoryManager> {
        Box::new(MemoryManager::new(ARENA))
    }

    #[test]
    fn split_straddling_range() {
        assert_eq!(
            split_identity_range(0x003F_F000, 0x0080_0000),
            (Some((0x003F_F000, 0x0040_0000)), Some((0x0040_0000, 0x0080_0000)))
        );
        assert_eq!(split_identity_range(0xB8000, 0xBC000), (Some((0xB8000, 0xBC000)), None));
        assert_eq!(split_identity_range(0x0040_0000, 0x0040_0000), (None, None));
    }

    #[test]
    fn identity_range_uses_both_granularities() {
        let mut mm = manager();
        mm.enable_identity_range(PhysAddr(0x003F_E000), PhysAddr(0x0080_0000));

        let k = AddressSpaceId::Kernel;
        assert_eq!(mm.translate(k, VirtAddr(0x003F_E010)), Some(PhysAddr(0x003F_E010)));
        assert_eq!(mm.translate(k, VirtAddr(0x0051_2345)), Some(PhysAddr(0x0051_2345)));
        assert!(mm.leaf_entry(k, VirtAddr(0x0040_0000)).unwrap().is_large());
        assert!(mm
            .leaf_entry(k, VirtAddr(0x003F_F000))
            .unwrap()
            .flags()
            .contains(PageFlags::GLOBAL));
        // 範囲外は入っていない
        assert_eq!(mm.translate(k, VirtAddr(0x003F_D000)), None);
        assert_eq!(mm.translate(k, VirtAddr(0x0080_0000)), None);
        // 2 small + 1 large
        assert_eq!(mm.mapping_count(k), 3);
    }

    #[test]
    fn empty_identity_range_is_noop() {
        let mut mm = manager();
        mm.enable_identity_range(PhysAddr(0x0080_0000), PhysAddr(0x0040_0000));
        assert_eq!(mm.present_entries(AddressSpaceId::Kernel), 0);
    }

    #[test]
    fn double_map_conflicts_and_keeps_original() {
        let mut mm = manager();
        let s = mm.claim(0).unwrap();

        mm.map(s, VirtAddr(0x0800_0000), PhysAddr(0x0080_0000), PageFlags::USER | PageFlags::WRITABLE)
            .unwrap();
        assert_eq!(
            mm.map(s, VirtAddr(0x0800_0000), PhysAddr(0x00C0_0000), PageFlags::WRITABLE),
            Err(AddressSpaceError::MappingConflict)
        );
        let e = mm.leaf_entry(s, VirtAddr(0x0800_0000)).unwrap();
        assert_eq!(e.base(), PhysAddr(0x0080_0000));
        assert!(e.flags().contains(PageFlags::USER));

        mm.map(s, VirtAddr(0xB8000), PhysAddr(0xB8000), PageFlags::USER).unwrap();
        assert_eq!(
            mm.map(s, VirtAddr(0xB8000), PhysAddr(0xB9000), PageFlags::USER),
            Err(AddressSpaceError::MappingConflict)
        );
        assert_eq!(mm.translate(s, VirtAddr(0xB8004)), Some(PhysAddr(0xB8004)));
    }

    #[test]
    fn remap_without_map_is_absent() {
        let mut mm = manager();
        let s = mm.claim(1).unwrap();
        assert_eq!(
            mm.remap(s, VirtAddr(0xB8000), PhysAddr(0xB9000), PageFlags::USER),
            Err(AddressSpaceError::MappingAbsent)
        );
        assert_eq!(
            mm.remap(s, VirtAddr(0x0800_0000), PhysAddr(0x0080_0000), PageFlags::USER),
            Err(AddressSpaceError::MappingAbsent)
        );

        // PT はあるが該当 PTE が無い場合も absent
        mm.map(s, VirtAddr(0xB9000), PhysAddr(0xB9000), PageFlags::WRITABLE).unwrap();
        assert_eq!(
            mm.remap(s, VirtAddr(0xB8000), PhysAddr(0xB9000), PageFlags::USER),
            Err(AddressSpaceError::MappingAbsent)
        );
    }

    #[test]
    fn remap_redirects_existing_page() {
        let mut mm = manager();
        let s = mm.claim(2).unwrap();
        mm.map(s, VirtAddr(0xB8000), PhysAddr(0xB8000), PageFlags::USER | PageFlags::WRITABLE)
            .unwrap();
        mm.remap(s, VirtAddr(0xB8000), PhysAddr(0xBA000), PageFlags::USER | PageFlags::WRITABLE)
            .unwrap();
        assert_eq!(mm.translate(s, VirtAddr(0xB8010)), Some(PhysAddr(0xBA010)));
    }

    #[test]
    fn teardown_zeroes_everything_and_rejects_second_call() {
        let mut mm = manager();
        let s = mm.claim(0).unwrap();
        mm.map(s, VirtAddr(0x0800_0000), PhysAddr(0x0080_0000), PageFlags::USER).unwrap();
        mm.map(s, VirtAddr(0x0040_0000), PhysAddr(0x0040_0000), PageFlags::GLOBAL).unwrap();
        mm.map(s, VirtAddr(0xB8000), PhysAddr(0xB8000), PageFlags::USER).unwrap();
        assert!(mm.present_entries(s) > 0);

        mm.teardown(s).unwrap();
        assert_eq!(mm.present_entries(s), 0);
        assert_eq!(mm.teardown(s), Err(AddressSpaceError::NotOwned));
        assert_eq!(
            mm.map(s, VirtAddr(0xB8000), PhysAddr(0xB8000), PageFlags::USER),
            Err(AddressSpaceError::NotOwned)
        );

        // slot は再利用できる
        assert_eq!(mm.claim(0), Ok(s));
        assert_eq!(mm.mapping_count(s), 0);
    }

    #[test]
    fn teardown_rules() {
        let mut mm = manager();
        let mut m = SimMachine::new();
        assert_eq!(mm.teardown(AddressSpaceId::Kernel), Err(AddressSpaceError::KernelSpace));
        assert_eq!(mm.teardown(AddressSpaceId::Process(3)), Err(AddressSpaceError::NotOwned));
        assert_eq!(
            mm.teardown(AddressSpaceId::Process(MAX_PROCESSES)),
            Err(AddressSpaceError::BadSlot)
        );

        let s = mm.claim(3).unwrap();
        mm.activate(s, &mut m).unwrap();
        assert_eq!(mm.teardown(s), Err(AddressSpaceError::ActiveSpace));
        mm.activate(AddressSpaceId::Kernel, &mut m).unwrap();
        assert_eq!(mm.teardown(s), Ok(()));
    }

    #[test]
    fn activate_loads_distinct_roots() {
        let mut mm = manager();
        let mut m = SimMachine::new();
        let a = mm.claim(0).unwrap();
        let b = mm.claim(1).unwrap();

        mm.activate(a, &mut m).unwrap();
        let root_a = m.cr3().unwrap();
        mm.activate(b, &mut m).unwrap();
        let root_b = m.cr3().unwrap();

        assert_ne!(root_a, root_b);
        assert!(root_a.is_aligned() && root_b.is_aligned());
        assert_eq!(mm.active(), b);
        assert_eq!(m.cr3_loads(), 2);

        assert_eq!(
            mm.activate(AddressSpaceId::Process(4), &mut m),
            Err(AddressSpaceError::NotOwned)
        );
        assert_eq!(mm.active(), b);
    }

    #[test]
    fn table_link_points_inside_arena() {
        let mut mm = manager();
        let s = mm.claim(5).unwrap();
        mm.map(s, VirtAddr(0xB8000), PhysAddr(0xB8000), PageFlags::USER).unwrap();
        let root = mm.root_of(s).unwrap();
        let link = mm.dir(s).entries[0];
        assert!(link.is_present() && !link.is_large());
        assert!(link.base() >= ARENA && link.base() != root);
        assert!(link.flags().contains(PageFlags::USER));
    }

    #[test]
    fn claim_rules() {
        let mut mm = manager();
        assert_eq!(mm.claim(0), Ok(AddressSpaceId::Process(0)));
        assert_eq!(mm.claim(0), Err(AddressSpaceError::AlreadyOwned));
        assert_eq!(mm.claim(MAX_PROCESSES), Err(AddressSpaceError::BadSlot));
    }
}
