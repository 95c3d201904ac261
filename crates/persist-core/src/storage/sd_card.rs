//! SD card backed [`BlockFilesystem`]
//!
//! Uses embedded-sdmmc's raw handle API so a file can stay open between
//! calls: the settings store keeps its validated generation open while the
//! controller runs.
//!
//! Like the rest of the SD card code these operations block. They are only
//! issued while the machine is idle.

use core::convert::Infallible;
use core::fmt::Debug;

use embedded_hal::digital::{ErrorType, InputPin};
use embedded_sdmmc::{
    BlockDevice, Error as VolumeError, Mode, RawDirectory, RawFile, RawVolume, TimeSource,
    VolumeIdx, VolumeManager,
};
use log::{debug, info, warn};
use thiserror_no_std::Error;

use super::fs::{BlockFilesystem, MediaStatus, OpenMode, split_path};

/// Files the store may hold open at once (baseline and next generation)
const MAX_OPEN_FILES: usize = 4;

type Volumes<D, T> = VolumeManager<D, T, 4, MAX_OPEN_FILES, 1>;

#[derive(Error, Debug)]
pub enum SdCardError<E: Debug> {
    #[error("volume not mounted")]
    NotMounted,
    #[error("no card in slot")]
    NoCard,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("unknown file handle")]
    BadHandle,
    #[error("volume error: {0:?}")]
    Volume(VolumeError<E>),
}

impl<E: Debug> From<VolumeError<E>> for SdCardError<E> {
    fn from(e: VolumeError<E>) -> Self {
        Self::Volume(e)
    }
}

/// Card-detect input for slots without a detect switch: always present.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCardDetect;

impl ErrorType for NoCardDetect {
    type Error = Infallible;
}

impl InputPin for NoCardDetect {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(false)
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy)]
struct Mounted {
    volume: RawVolume,
    root: RawDirectory,
}

/// FAT volume 0 of an SD card, one directory level deep.
pub struct SdCardFilesystem<D, T, P>
where
    D: BlockDevice,
    T: TimeSource,
{
    volume_mgr: Volumes<D, T>,
    /// Card-detect switch, low while a card is inserted
    card_detect: P,
    card_present: bool,
    mounted: Option<Mounted>,
    open_files: heapless::Vec<RawFile, MAX_OPEN_FILES>,
}

impl<D, T> SdCardFilesystem<D, T, NoCardDetect>
where
    D: BlockDevice,
    T: TimeSource,
{
    pub fn new(device: D, time_source: T) -> Self {
        Self::with_card_detect(device, time_source, NoCardDetect)
    }
}

impl<D, T, P> SdCardFilesystem<D, T, P>
where
    D: BlockDevice,
    T: TimeSource,
    P: InputPin,
{
    pub fn with_card_detect(device: D, time_source: T, card_detect: P) -> Self {
        Self {
            volume_mgr: VolumeManager::new(device, time_source),
            card_detect,
            card_present: true,
            mounted: None,
            open_files: heapless::Vec::new(),
        }
    }

    fn mounted(&self) -> Result<Mounted, SdCardError<D::Error>> {
        if !self.card_present {
            return Err(SdCardError::NoCard);
        }
        self.mounted.ok_or(SdCardError::NotMounted)
    }

    fn tracked(&self, file: RawFile) -> Result<(), SdCardError<D::Error>> {
        if self.open_files.contains(&file) {
            Ok(())
        } else {
            Err(SdCardError::BadHandle)
        }
    }

    /// Runs `op` in the directory holding `path`.
    fn in_dir<R>(
        &mut self,
        path: &str,
        op: impl FnOnce(&Volumes<D, T>, RawDirectory, &str) -> Result<R, VolumeError<D::Error>>,
    ) -> Result<R, SdCardError<D::Error>> {
        let mounted = self.mounted()?;
        let (dir, name) = split_path(path);

        let Some(dir) = dir else {
            return Ok(op(&self.volume_mgr, mounted.root, name)?);
        };
        let handle = self.volume_mgr.open_dir(mounted.root, dir)?;
        let result = op(&self.volume_mgr, handle, name);
        if let Err(e) = self.volume_mgr.close_dir(handle) {
            warn!("Failed to close directory {}: {:?}", dir, e);
        }
        Ok(result?)
    }

    /// Releases everything opened on the old card. Failures are expected
    /// when the card is already gone.
    fn unmount(&mut self) {
        for file in self.open_files.iter() {
            if let Err(e) = self.volume_mgr.close_file(*file) {
                debug!("close of {:?} on removed card: {:?}", file, e);
            }
        }
        self.open_files.clear();

        if let Some(mounted) = self.mounted.take() {
            if let Err(e) = self.volume_mgr.close_dir(mounted.root) {
                debug!("close of root dir on removed card: {:?}", e);
            }
            if let Err(e) = self.volume_mgr.close_volume(mounted.volume) {
                debug!("close of volume on removed card: {:?}", e);
            }
        }
    }
}

impl<D, T, P> BlockFilesystem for SdCardFilesystem<D, T, P>
where
    D: BlockDevice,
    T: TimeSource,
    P: InputPin,
{
    type Error = SdCardError<D::Error>;
    type File = RawFile;

    fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn mount(&mut self) -> Result<(), Self::Error> {
        if !self.card_present {
            return Err(SdCardError::NoCard);
        }
        if self.mounted.is_some() {
            return Ok(());
        }

        let volume = self.volume_mgr.open_raw_volume(VolumeIdx(0))?;
        let root = match self.volume_mgr.open_root_dir(volume) {
            Ok(root) => root,
            Err(e) => {
                if let Err(close_err) = self.volume_mgr.close_volume(volume) {
                    debug!("close of half-mounted volume failed: {:?}", close_err);
                }
                return Err(e.into());
            }
        };
        self.mounted = Some(Mounted { volume, root });
        Ok(())
    }

    fn make_dir(&mut self, dir: &str) -> Result<(), Self::Error> {
        let mounted = self.mounted()?;
        match self.volume_mgr.make_dir_in_dir(mounted.root, dir) {
            Ok(()) | Err(VolumeError::DirAlreadyExists) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&mut self, path: &str) -> Result<bool, Self::Error> {
        let found = self.in_dir(path, |mgr, dir, name| {
            match mgr.find_directory_entry(dir, name) {
                Ok(_) => Ok(true),
                Err(VolumeError::NotFound) => Ok(false),
                Err(e) => Err(e),
            }
        });
        match found {
            // Missing parent directory
            Err(SdCardError::Volume(VolumeError::NotFound)) => Ok(false),
            other => other,
        }
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<RawFile, Self::Error> {
        if self.open_files.is_full() {
            return Err(SdCardError::TooManyOpenFiles);
        }
        let mode = match mode {
            OpenMode::Read => Mode::ReadOnly,
            OpenMode::CreateTruncate => Mode::ReadWriteCreateOrTruncate,
        };

        let file = self.in_dir(path, |mgr, dir, name| mgr.open_file_in_dir(dir, name, mode))?;
        if self.open_files.push(file).is_err() {
            warn!("Open file table full, closing {}", path);
            self.volume_mgr.close_file(file)?;
            return Err(SdCardError::TooManyOpenFiles);
        }
        Ok(file)
    }

    fn close(&mut self, file: RawFile) -> Result<(), Self::Error> {
        let slot = self
            .open_files
            .iter()
            .position(|&f| f == file)
            .ok_or(SdCardError::BadHandle)?;
        self.open_files.swap_remove(slot);
        self.volume_mgr.close_file(file)?;
        Ok(())
    }

    fn validate(&mut self, file: RawFile) -> Result<(), Self::Error> {
        self.mounted()?;
        self.tracked(file)?;
        self.volume_mgr.file_offset(file)?;
        Ok(())
    }

    fn seek(&mut self, file: RawFile, offset: u32) -> Result<(), Self::Error> {
        self.tracked(file)?;
        self.volume_mgr.file_seek_from_start(file, offset)?;
        Ok(())
    }

    fn read(&mut self, file: RawFile, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.tracked(file)?;
        Ok(self.volume_mgr.read(file, buf)?)
    }

    fn write(&mut self, file: RawFile, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tracked(file)?;
        self.volume_mgr.write(file, buf)?;
        Ok(buf.len())
    }

    fn sync(&mut self, file: RawFile) -> Result<(), Self::Error> {
        self.tracked(file)?;
        self.volume_mgr.flush_file(file)?;
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), Self::Error> {
        self.in_dir(path, |mgr, dir, name| mgr.delete_file_in_dir(dir, name))
    }

    fn is_eof(&mut self, file: RawFile) -> Result<bool, Self::Error> {
        self.tracked(file)?;
        Ok(self.volume_mgr.file_eof(file)?)
    }

    fn remaining(&mut self, file: RawFile) -> Result<u32, Self::Error> {
        self.tracked(file)?;
        let length = self.volume_mgr.file_length(file)?;
        let offset = self.volume_mgr.file_offset(file)?;
        Ok(length.saturating_sub(offset))
    }

    fn poll_media(&mut self) -> MediaStatus {
        let present = match self.card_detect.is_low() {
            Ok(present) => present,
            Err(e) => {
                debug!("card detect read failed: {:?}", e);
                self.card_present
            }
        };
        let was_present = core::mem::replace(&mut self.card_present, present);

        match (was_present, present) {
            (true, true) => MediaStatus::Present,
            (false, true) => {
                info!("SD card inserted");
                MediaStatus::Changed
            }
            (true, false) => {
                info!("SD card removed");
                self.unmount();
                MediaStatus::Absent
            }
            (false, false) => MediaStatus::Absent,
        }
    }
}
