// kernel/src/fs/image.rs
//
// 読み取り専用ファイルシステムイメージ（ブートモジュール）の読み出し。
//
// 形式（すべて little endian, ブロック 4KiB）:
//   block 0         : boot block
//                     u32 dentry 数, u32 inode 数, u32 data block 数, 52 バイト予約,
//                     以降 64 バイトごとの dentry（name[32], type u32, inode u32, 24 バイト予約）
//   block 1..=N     : inode（u32 長さ, u32 データブロック番号 x 1023）
//   block N+1..     : data block
//
// イメージはメモリ上のスライスとして渡される（identity map 済みの領域を想定）。

use crate::fs::{Dentry, FileSystem, FileType, FsError, MAX_FILE_NAME};

pub const BLOCK_SIZE: usize = 4096;
pub const DENTRY_SIZE: usize = 64;
/// boot block の統計部分の大きさ（= 最初の dentry の位置）
pub const BOOT_HEADER_SIZE: usize = 64;
pub const MAX_DENTRIES: usize = (BLOCK_SIZE - BOOT_HEADER_SIZE) / DENTRY_SIZE;
pub const BLOCKS_PER_INODE: usize = 1023;

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, FsError> {
    let raw = bytes.get(at..at + 4).ok_or(FsError::Corrupt)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

#[derive(Clone, Copy)]
pub struct ReadOnlyFs<'a> {
    image: &'a [u8],
    num_dentries: u32,
    num_inodes: u32,
    num_data_blocks: u32,
}

impl<'a> ReadOnlyFs<'a> {
    /// boot block を読み、宣言された大きさがイメージに収まっているか確認する。
    pub fn new(image: &'a [u8]) -> Result<Self, FsError> {
        let num_dentries = read_u32(image, 0)?;
        let num_inodes = read_u32(image, 4)?;
        let num_data_blocks = read_u32(image, 8)?;

        if num_dentries as usize > MAX_DENTRIES {
            return Err(FsError::Corrupt);
        }
        let blocks = 1u64 + num_inodes as u64 + num_data_blocks as u64;
        if blocks * BLOCK_SIZE as u64 > image.len() as u64 {
            return Err(FsError::Corrupt);
        }

        Ok(ReadOnlyFs {
            image,
            num_dentries,
            num_inodes,
            num_data_blocks,
        })
    }

    fn inode_base(&self, inode: u32) -> Result<usize, FsError> {
        if inode >= self.num_inodes {
            return Err(FsError::BadInode);
        }
        Ok(BLOCK_SIZE * (inode as usize + 1))
    }

    fn data_block(&self, index: u32) -> Result<&'a [u8], FsError> {
        if index >= self.num_data_blocks {
            return Err(FsError::Corrupt);
        }
        let start = BLOCK_SIZE * (1 + self.num_inodes as usize + index as usize);
        self.image.get(start..start + BLOCK_SIZE).ok_or(FsError::Corrupt)
    }

    fn parse_dentry(&self, index: u32) -> Result<Dentry, FsError> {
        let base = BOOT_HEADER_SIZE + DENTRY_SIZE * index as usize;
        let name = self.image.get(base..base + MAX_FILE_NAME).ok_or(FsError::Corrupt)?;
        let file_type = FileType::from_raw(read_u32(self.image, base + 32)?).ok_or(FsError::Corrupt)?;
        let inode = read_u32(self.image, base + 36)?;
        Ok(Dentry::new(name, file_type, inode))
    }
}

impl<'a> FileSystem for ReadOnlyFs<'a> {
    fn lookup(&self, name: &[u8]) -> Result<Dentry, FsError> {
        if name.is_empty() || name.len() > MAX_FILE_NAME {
            return Err(FsError::NotFound);
        }
        for i in 0..self.num_dentries {
            let d = self.parse_dentry(i)?;
            if d.name() == name {
                return Ok(d);
            }
        }
        Err(FsError::NotFound)
    }

    fn dentry_at(&self, index: u32) -> Result<Dentry, FsError> {
        if index >= self.num_dentries {
            return Err(FsError::BadIndex);
        }
        self.parse_dentry(index)
    }

    fn dentry_count(&self) -> u32 {
        self.num_dentries
    }

    fn file_len(&self, inode: u32) -> Result<u32, FsError> {
        let base = self.inode_base(inode)?;
        read_u32(self.image, base)
    }

    fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
        let base = self.inode_base(inode)?;
        let length = read_u32(self.image, base)? as usize;
        let offset = offset as usize;
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }

        let want = buf.len().min(length - offset);
        let mut done = 0;
        while done < want {
            let pos = offset + done;
            let slot = pos / BLOCK_SIZE;
            if slot >= BLOCKS_PER_INODE {
                return Err(FsError::Corrupt);
            }
            let block_index = read_u32(self.image, base + 4 + 4 * slot)?;
            let block = self.data_block(block_index)?;

            let in_block = pos % BLOCK_SIZE;
            let n = (BLOCK_SIZE - in_block).min(want - done);
            buf[done..done + n].copy_from_slice(&block[in_block..in_block + n]);
            done += n;
        }
        Ok(done)
    }
}
