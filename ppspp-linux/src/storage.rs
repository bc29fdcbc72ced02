//! Chunks stored in place in a single file at `index * chunk_size`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use ppspp_core::{Bin, Storage, StorageError};

pub struct FileStorage {
    file: File,
    chunk_size: u64,
}

impl FileStorage {
    /// Existing content to seed. Opened read-write so verified chunks can be rewritten.
    pub fn open(path: &Path, chunk_size: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            chunk_size: u64::from(chunk_size),
        })
    }

    /// Download target. Existing bytes are kept so a download can resume.
    pub fn create(path: &Path, chunk_size: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            chunk_size: u64::from(chunk_size),
        })
    }

    pub fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read the whole file; used to build the hash tree when seeding.
    pub fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    fn offset(&self, bin: Bin) -> Result<u64, StorageError> {
        if !bin.is_leaf() {
            return Err(StorageError::NotLeaf(bin));
        }
        Ok(bin.base_offset() * self.chunk_size)
    }
}

impl Storage for FileStorage {
    fn write_chunk(&mut self, bin: Bin, data: &[u8]) -> Result<(), StorageError> {
        if data.len() as u64 > self.chunk_size {
            return Err(StorageError::TooLarge {
                got: data.len(),
                max: self.chunk_size as usize,
            });
        }
        let offset = self.offset(bin)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_chunk(&mut self, bin: Bin) -> Result<Option<Vec<u8>>, StorageError> {
        let offset = self.offset(bin)?;
        let len = self.len()?;
        if offset >= len {
            return Ok(None);
        }
        let n = (len - offset).min(self.chunk_size) as usize;
        let mut buf = vec![0u8; n];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("ppspp-{}-{name}", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn chunks_land_at_their_offsets() {
        let path = scratch("offsets");
        let mut s = FileStorage::create(&path, 4).unwrap();
        s.write_chunk(Bin::chunk(1), b"efgh").unwrap();
        s.write_chunk(Bin::chunk(0), b"abcd").unwrap();
        s.write_chunk(Bin::chunk(2), b"ij").unwrap();
        assert_eq!(s.read_all().unwrap(), b"abcdefghij".to_vec());
        assert_eq!(s.read_chunk(Bin::chunk(2)).unwrap(), Some(b"ij".to_vec()));
        assert_eq!(s.read_chunk(Bin::chunk(3)).unwrap(), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_oversized_and_non_leaf() {
        let path = scratch("reject");
        let mut s = FileStorage::create(&path, 4).unwrap();
        assert!(matches!(
            s.write_chunk(Bin::chunk(0), b"abcde"),
            Err(StorageError::TooLarge { got: 5, max: 4 })
        ));
        assert!(matches!(
            s.read_chunk(Bin::new(1)),
            Err(StorageError::NotLeaf(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reopen_keeps_existing_bytes() {
        let path = scratch("reopen");
        std::fs::write(&path, b"0123456789").unwrap();
        let mut s = FileStorage::create(&path, 4).unwrap();
        assert_eq!(s.len().unwrap(), 10);
        assert_eq!(s.read_chunk(Bin::chunk(1)).unwrap(), Some(b"4567".to_vec()));
        let mut seed = FileStorage::open(&path, 4).unwrap();
        assert_eq!(seed.read_all().unwrap().len(), 10);
        std::fs::remove_file(&path).unwrap();
    }
}
