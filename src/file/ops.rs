use crate::{
    error::{Error, Result},
    file::File,
    poll::PollEvents,
};

/// Attributes reported by [FileOps::stat].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
    pub block_size: u32,
}

/// An implementation of `FileOps` provides the operations of one file type.
///
/// Implementations live in `static`s and receive the [File] they are invoked on. Type-specific
/// state is reached through [File::lock].
///
/// The provided method bodies are the responses of a type that does not support the operation,
/// so a type only overrides what it implements.
pub trait FileOps: Sync {
    /// Runs once, right after the operations are installed on a file.
    fn init(&self, _fp: &File) -> Result<()> {
        Ok(())
    }

    /// Reads into `buf` at `offset`, or at the file offset when `offset` is `None`.
    fn read(&self, _fp: &File, _buf: &mut [u8], _offset: Option<u64>) -> Result<usize> {
        Err(Error::InvalidArgument)
    }

    /// Writes `buf` at `offset`, or at the file offset when `offset` is `None`.
    fn write(&self, _fp: &File, _buf: &[u8], _offset: Option<u64>) -> Result<usize> {
        Err(Error::InvalidArgument)
    }

    fn truncate(&self, _fp: &File, _len: u64) -> Result<()> {
        Err(Error::InvalidArgument)
    }

    /// Performs the device-specific request `cmd`, returning a request-specific value.
    fn ioctl(&self, _fp: &File, _cmd: u64, _arg: usize) -> Result<usize> {
        Err(Error::InvalidArgument)
    }

    /// Returns the subset of `events` that is ready right now.
    fn poll(&self, _fp: &File, _events: PollEvents) -> PollEvents {
        PollEvents::empty()
    }

    fn stat(&self, _fp: &File) -> Result<FileStat> {
        Err(Error::InvalidArgument)
    }

    /// Runs once, when the last reference to the file is released.
    fn close(&self, _fp: &File) -> Result<()> {
        Ok(())
    }

    fn chmod(&self, _fp: &File, _mode: u32) -> Result<()> {
        Err(Error::InvalidArgument)
    }
}

/// Operations installed on every file before it is initialized.
pub struct BadFileOps;

pub static BAD_FILE_OPS: BadFileOps = BadFileOps;

impl FileOps for BadFileOps {
    fn init(&self, _fp: &File) -> Result<()> {
        Err(Error::BadDescriptor)
    }

    fn read(&self, _fp: &File, _buf: &mut [u8], _offset: Option<u64>) -> Result<usize> {
        Err(Error::BadDescriptor)
    }

    fn write(&self, _fp: &File, _buf: &[u8], _offset: Option<u64>) -> Result<usize> {
        Err(Error::BadDescriptor)
    }

    fn truncate(&self, _fp: &File, _len: u64) -> Result<()> {
        Err(Error::InvalidArgument)
    }

    fn ioctl(&self, _fp: &File, _cmd: u64, _arg: usize) -> Result<usize> {
        Err(Error::InvalidArgument)
    }

    // Polling a file that has no type yet must not fail the caller.
    fn poll(&self, _fp: &File, _events: PollEvents) -> PollEvents {
        PollEvents::empty()
    }

    fn stat(&self, _fp: &File) -> Result<FileStat> {
        Err(Error::BadDescriptor)
    }

    fn close(&self, _fp: &File) -> Result<()> {
        Err(Error::BadDescriptor)
    }

    fn chmod(&self, _fp: &File, _mode: u32) -> Result<()> {
        Err(Error::BadDescriptor)
    }
}
