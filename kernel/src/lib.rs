// kernel/src/lib.rs
//
// termos: 3 端末の保護モードカーネルの、プロセスと仮想メモリの core。
//
// - mem:    ページディレクトリ / テーブルの arena とアドレス空間
// - kernel: プロセス表・execute / halt・端末切替・スケジューラ・system call
// - fs:     読み取り専用ファイルシステム
// - arch:   Machine trait（実機とホスト用の sim）
//
// 実機（i386, target_os = "none"）では no_std。ホストの cargo test では std で動く。

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod fs;
pub mod kernel;
pub mod logging;
pub mod mem;

#[cfg(all(target_arch = "x86", target_os = "none", not(test)))]
mod panic;

#[cfg(test)]
mod testkit;
