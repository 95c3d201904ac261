//! Host directory standing in for the SD card.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::info;
use persist_core::storage::{BlockFilesystem, MediaStatus, OpenMode};

/// Handle into [`StdFs`]'s open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdFile(usize);

struct OpenFile {
    file: File,
    /// Card insertion the file was opened under
    epoch: u32,
}

/// Filesystem rooted at a host directory, with a simulated card slot.
pub struct StdFs {
    root: PathBuf,
    files: Vec<Option<OpenFile>>,
    mounted: bool,
    present: bool,
    changed: bool,
    epoch: u32,
}

impl StdFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Vec::new(),
            mounted: false,
            present: true,
            changed: false,
            epoch: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pulls the card: unmounts and invalidates every open handle.
    pub fn eject(&mut self) {
        info!("Ejecting card at {}", self.root.display());
        self.files.clear();
        self.mounted = false;
        self.present = false;
        self.changed = true;
        self.epoch += 1;
    }

    pub fn insert(&mut self) {
        info!("Inserting card at {}", self.root.display());
        self.present = true;
        self.changed = true;
    }

    fn ready(&self) -> io::Result<()> {
        if !self.present {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no card in slot"));
        }
        if !self.mounted {
            return Err(io::Error::other("volume not mounted"));
        }
        Ok(())
    }

    fn handle(&mut self, file: StdFile) -> io::Result<&mut File> {
        self.ready()?;
        let epoch = self.epoch;
        match self.files.get_mut(file.0) {
            Some(Some(open)) if open.epoch == epoch => Ok(&mut open.file),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "stale file handle")),
        }
    }

    fn position(&mut self, file: StdFile) -> io::Result<(u64, u64)> {
        let handle = self.handle(file)?;
        let pos = handle.stream_position()?;
        let len = handle.metadata()?.len();
        Ok((pos, len))
    }
}

impl BlockFilesystem for StdFs {
    type Error = io::Error;
    type File = StdFile;

    fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn mount(&mut self) -> io::Result<()> {
        if !self.present {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no card in slot"));
        }
        fs::create_dir_all(&self.root)?;
        self.mounted = true;
        Ok(())
    }

    fn make_dir(&mut self, dir: &str) -> io::Result<()> {
        self.ready()?;
        match fs::create_dir(self.root.join(dir)) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => other,
        }
    }

    fn exists(&mut self, path: &str) -> io::Result<bool> {
        self.ready()?;
        Ok(self.root.join(path).is_file())
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<StdFile> {
        self.ready()?;
        let path = self.root.join(path);
        let file = match mode {
            OpenMode::Read => File::open(path)?,
            OpenMode::CreateTruncate => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        };

        let open = OpenFile {
            file,
            epoch: self.epoch,
        };
        let slot = match self.files.iter().position(Option::is_none) {
            Some(slot) => {
                self.files[slot] = Some(open);
                slot
            }
            None => {
                self.files.push(Some(open));
                self.files.len() - 1
            }
        };
        Ok(StdFile(slot))
    }

    fn close(&mut self, file: StdFile) -> io::Result<()> {
        match self.files.get_mut(file.0).and_then(Option::take) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "file not open")),
        }
    }

    fn validate(&mut self, file: StdFile) -> io::Result<()> {
        self.handle(file).map(|_| ())
    }

    fn seek(&mut self, file: StdFile, offset: u32) -> io::Result<()> {
        self.handle(file)?.seek(SeekFrom::Start(offset.into()))?;
        Ok(())
    }

    /// Fills `buf` unless the end of the file comes first.
    fn read(&mut self, file: StdFile, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.handle(file)?;
        let mut filled = 0;
        while filled < buf.len() {
            match handle.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write(&mut self, file: StdFile, buf: &[u8]) -> io::Result<usize> {
        self.handle(file)?.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&mut self, file: StdFile) -> io::Result<()> {
        self.handle(file)?.sync_all()
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.ready()?;
        fs::remove_file(self.root.join(path))
    }

    fn is_eof(&mut self, file: StdFile) -> io::Result<bool> {
        let (pos, len) = self.position(file)?;
        Ok(pos >= len)
    }

    fn remaining(&mut self, file: StdFile) -> io::Result<u32> {
        let (pos, len) = self.position(file)?;
        Ok(u32::try_from(len.saturating_sub(pos)).unwrap_or(u32::MAX))
    }

    fn poll_media(&mut self) -> MediaStatus {
        if !self.present {
            return MediaStatus::Absent;
        }
        if std::mem::take(&mut self.changed) {
            return MediaStatus::Changed;
        }
        MediaStatus::Present
    }
}
