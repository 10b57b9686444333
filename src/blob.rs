//! Positioned reads against shard files
//!
//! Row-mode workers each own one handle per shard so seeks never contend;
//! block mode keeps a single handle per shard behind a mutex and lets the
//! page-read slot serialise the workers.

use crate::Result;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// One read handle on a shard file.
pub struct BlobFile {
    file: File,
    path: PathBuf,
}

impl BlobFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seek to `offset` and read exactly `len` bytes.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Open the row-mode handle matrix: `n_consumer` duplicated handles per
/// shard, indexed `[worker][shard]`. Each worker later takes ownership of
/// its row.
pub fn open_matrix(paths: &[PathBuf], n_consumer: usize) -> Result<Vec<Vec<BlobFile>>> {
    let mut matrix = Vec::with_capacity(n_consumer);
    for _ in 0..n_consumer {
        let mut row = Vec::with_capacity(paths.len());
        for path in paths {
            row.push(BlobFile::open(path)?);
        }
        matrix.push(row);
    }
    Ok(matrix)
}

/// Open the block-mode handle set: one shared handle per shard.
pub fn open_shared(paths: &[PathBuf]) -> Result<Vec<Mutex<BlobFile>>> {
    paths
        .iter()
        .map(|path| BlobFile::open(path).map(Mutex::new))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_read_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.mr");
        File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let mut blob = BlobFile::open(&path).unwrap();
        assert_eq!(blob.read_at(3, 4).unwrap(), b"3456");
        assert_eq!(blob.read_at(0, 1).unwrap(), b"0");
    }

    #[test]
    fn test_short_read_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.mr");
        File::create(&path).unwrap().write_all(b"abc").unwrap();

        let mut blob = BlobFile::open(&path).unwrap();
        assert!(blob.read_at(1, 16).is_err());
    }

    #[test]
    fn test_open_matrix_shape() {
        let dir = tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..2 {
            let path = dir.path().join(format!("shard-{}.mr", i));
            File::create(&path).unwrap().write_all(b"x").unwrap();
            paths.push(path);
        }

        let matrix = open_matrix(&paths, 3).unwrap();
        assert_eq!(matrix.len(), 3);
        assert!(matrix.iter().all(|row| row.len() == 2));
    }
}
