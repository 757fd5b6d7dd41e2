use std::{fs, path, io::{Read, Write, Seek}};
use crate::store::FileInfo;
use super::Result;

#[derive(Debug)]
pub struct TorrentFile {
    pub info: FileInfo,
    pub handle: fs::File,
}

impl TorrentFile {

    pub fn new(dir: &path::Path, info: FileInfo) -> Result<Self> {

        let path = dir.join(&info.path);
        tracing::info!("creating file: {:?}", &path);
        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            info,
            handle,
        })
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        self.handle.seek(std::io::SeekFrom::Start(offset as u64))?;
        Ok(self.handle.write(data)?)
    }

    pub fn write_blocks(
        &mut self,
        offset: usize,
        blocks: &[std::io::IoSlice<'_>],
    ) -> Result<usize> {
        let mut n = 0;
        self.handle.seek(std::io::SeekFrom::Start(offset as u64))?;
        n += self.handle.write_vectored(blocks)?;
        Ok(n)
    }

    pub fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.handle.seek(std::io::SeekFrom::Start(offset as u64))?;
        Ok(self.handle.read(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let info = FileInfo {
            path: "payload.bin".into(),
            length: 8,
            offset: 0,
            md5sum: None,
        };
        let mut file = TorrentFile::new(dir.path(), info).unwrap();
        file.write_at(0, b"deadbeef").unwrap();
        let mut buf = [0u8; 8];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"deadbeef");
    }
}
