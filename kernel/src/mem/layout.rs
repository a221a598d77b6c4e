// kernel/src/mem/layout.rs
//
// i386 2 段ページングの “形” を固定する定数。
// - 4KiB ページ / 4MiB large page の 2 種類だけを使う。
// - 4MiB 未満は page table 経由（4KiB 粒度）、4MiB 以上は PDE に直接 large page を置く。
//
// 具体的なアドレス配置（カーネル領域・プログラム窓・ビデオ等）は環境依存なので
// ここではなく config::Layout に置く。

/// 通常ページ（4KiB）
pub const PAGE_SIZE: u32 = 0x1000;

/// large page（4MiB）。PDE 1 個がカバーする範囲でもある。
pub const LARGE_PAGE_SIZE: u32 = 0x40_0000;

/// ページディレクトリ / ページテーブルのエントリ数
pub const ENTRY_COUNT: usize = 1024;

/// この境界より下は 4KiB、以上は 4MiB で map する。
pub const LARGE_PAGE_BOUNDARY: u32 = LARGE_PAGE_SIZE;

/// 4KiB エントリの物理ベース mask
pub const BASE_MASK: u32 = 0xFFFF_F000;

/// 4MiB エントリの物理ベース mask
pub const LARGE_BASE_MASK: u32 = 0xFFC0_0000;
