#[cfg(test)]
pub mod mock;

pub mod ops;

use std::{
    alloc::{self, Layout},
    any::Any,
    fmt,
    mem::ManuallyDrop,
    ops::Deref,
    ptr::NonNull,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering, fence},
    },
};

use bitflags::bitflags;
use crossbeam_epoch::{self as epoch, Shared};
use log::{debug, trace, warn};
use once_cell::sync::OnceCell;

use crate::{
    error::{Error, Result},
    poll::{PollEvents, PollWaiter},
};

pub use ops::{BAD_FILE_OPS, BadFileOps, FileOps, FileStat};

bitflags! {
    /// Flags a file was opened with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const NONBLOCK = 0x0004;
        const APPEND = 0x0008;
        const ASYNC = 0x0040;
    }
}

/// What kind of object a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Uninitialized,
    Regular,
    Socket,
    Pipe,
    Event,
}

/// Where a file is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    /// Allocated, still carrying [BadFileOps].
    Allocated = 0,
    /// Carries its real type and operations.
    Initialized = 1,
    /// The last reference is gone and the close hook is running.
    Closing = 2,
    /// Finalized. Only the memory remains, kept alive by slots that still name the file.
    Destroyed = 3,
}

impl Lifecycle {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Allocated,
            1 => Self::Initialized,
            2 => Self::Closing,
            _ => Self::Destroyed,
        }
    }
}

/// Mutable state of a file, guarded by the file's lock.
#[derive(Default)]
pub struct FileState {
    pub offset: u64,
    data: Option<Box<dyn Any + Send>>,
}

impl FileState {
    /// Returns the type-specific payload, if it is a `T`.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref()
    }

    /// Returns the type-specific payload mutably, if it is a `T`.
    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_mut()?.downcast_mut()
    }
}

struct Installed {
    ftype: FileType,
    ops: &'static dyn FileOps,
}

/// A kernel object representing one open file-like resource.
///
/// A `File` is only reachable through a [FileRef], which owns one reference to it, or through a
/// slot of a [FileTable](crate::table::FileTable).
pub struct File {
    count: AtomicUsize,
    // One pin for all references together, plus one per slot naming the file.
    pins: AtomicUsize,
    lifecycle: AtomicU8,
    flags: AtomicU32,
    installed: OnceCell<Installed>,
    state: Mutex<FileState>,
    pub(crate) poll_list: Mutex<Vec<Arc<PollWaiter>>>,
}

impl File {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            pins: AtomicUsize::new(1),
            lifecycle: AtomicU8::new(Lifecycle::Allocated as u8),
            flags: AtomicU32::new(0),
            installed: OnceCell::new(),
            state: Mutex::new(FileState::default()),
            poll_list: Mutex::new(Vec::new()),
        }
    }

    /// Allocates an uninitialized file with a reference count of one.
    pub fn allocate() -> Result<FileRef> {
        let layout = Layout::new::<File>();
        // SAFETY: `File` is not zero-sized.
        let raw = unsafe { alloc::alloc(layout) }.cast::<File>();
        let ptr = NonNull::new(raw).ok_or(Error::NoMemory)?;
        // SAFETY: `ptr` is freshly allocated with the layout of `File`.
        unsafe { ptr.as_ptr().write(File::new()) };

        trace!("allocated file {:p}", ptr);
        Ok(FileRef { ptr })
    }

    /// Installs the file's type, flags, payload and operations, then runs the `init` hook.
    ///
    /// Should complete before the file is published to other threads. Until it does, the file
    /// answers every operation with [BadFileOps].
    ///
    /// # Panics
    /// Panics if the file was already initialized, or if `ftype` is [FileType::Uninitialized].
    pub fn initialize<T: Any + Send>(
        &self,
        flags: OpenFlags,
        ftype: FileType,
        data: T,
        ops: &'static dyn FileOps,
    ) -> Result<()> {
        assert!(
            ftype != FileType::Uninitialized,
            "a file cannot be initialized as uninitialized"
        );

        // Claim the install first so a second call leaves the live file untouched.
        if self.installed.set(Installed { ftype, ops }).is_err() {
            panic!("file {:p} initialized twice", self);
        }
        self.flags.store(flags.bits(), Ordering::Release);
        self.lock().data = Some(Box::new(data));
        self.lifecycle
            .store(Lifecycle::Initialized as u8, Ordering::Release);

        debug!("initialized {:?} file {:p} with {:?}", ftype, self, flags);
        ops.init(self)
    }

    pub fn refcount(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_raw(self.lifecycle.load(Ordering::Acquire))
    }

    pub fn file_type(&self) -> FileType {
        self.installed
            .get()
            .map_or(FileType::Uninitialized, |installed| installed.ftype)
    }

    pub fn flags(&self) -> OpenFlags {
        OpenFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: OpenFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Returns the installed operations, or [BadFileOps] before initialization.
    pub fn ops(&self) -> &'static dyn FileOps {
        self.installed
            .get()
            .map_or(&BAD_FILE_OPS as &'static dyn FileOps, |installed| {
                installed.ops
            })
    }

    /// Locks the file's type-specific state.
    pub fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self, buf: &mut [u8], offset: Option<u64>) -> Result<usize> {
        if !self.flags().contains(OpenFlags::READ) {
            return Err(Error::BadDescriptor);
        }
        self.ops().read(self, buf, offset)
    }

    pub fn write(&self, buf: &[u8], offset: Option<u64>) -> Result<usize> {
        if !self.flags().contains(OpenFlags::WRITE) {
            return Err(Error::BadDescriptor);
        }
        self.ops().write(self, buf, offset)
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.ops().truncate(self, len)
    }

    pub fn ioctl(&self, cmd: u64, arg: usize) -> Result<usize> {
        self.ops().ioctl(self, cmd, arg)
    }

    pub fn poll(&self, events: PollEvents) -> PollEvents {
        self.ops().poll(self, events)
    }

    pub fn stat(&self) -> Result<FileStat> {
        self.ops().stat(self)
    }

    pub fn chmod(&self, mode: u32) -> Result<()> {
        self.ops().chmod(self, mode)
    }

    fn finalize(&self) {
        self.lifecycle
            .store(Lifecycle::Closing as u8, Ordering::Release);
        debug!("finalizing {:?} file {:p}", self.file_type(), self);

        // Files that never got a type fail the fallback close; nothing to report.
        let initialized = self.installed.get().is_some();
        if let Err(err) = self.ops().close(self) {
            if initialized {
                warn!("close of file {:p} failed: {}", self, err);
            }
        }
        self.poll_drain();
        *self.lock() = FileState::default();

        self.lifecycle
            .store(Lifecycle::Destroyed as u8, Ordering::Release);
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one pin, scheduling the memory for destruction when it was the last.
    ///
    /// # Safety
    /// The caller must own the pin being dropped.
    pub(crate) unsafe fn unpin(ptr: NonNull<File>) {
        // SAFETY: the caller's pin keeps the file allocated.
        let file = unsafe { ptr.as_ref() };
        let prev = file.pins.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "file {:p} pin count underflow", ptr);
        if prev != 1 {
            return;
        }
        fence(Ordering::Acquire);

        trace!("releasing memory of file {:p}", ptr);
        let guard = epoch::pin();
        // SAFETY: no slot names the file and no reference is left, so only readers pinned in the
        // current epoch can still see it. It was allocated with the layout of a `Box<File>`.
        unsafe { guard.defer_destroy(Shared::from(ptr.as_ptr() as *const File)) };
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("count", &self.refcount())
            .field("lifecycle", &self.lifecycle())
            .field("type", &self.file_type())
            .field("flags", &self.flags())
            .finish()
    }
}

/// An owned reference to a [File].
///
/// Cloning a `FileRef` holds the file, dropping it releases the file. The release that takes the
/// count to zero finalizes the file.
pub struct FileRef {
    ptr: NonNull<File>,
}

// SAFETY: `File` is `Sync` and its reference count is atomic.
unsafe impl Send for FileRef {}
// SAFETY: see above.
unsafe impl Sync for FileRef {}

impl FileRef {
    /// Acquires another reference to the file.
    pub fn hold(&self) -> FileRef {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "hold on a finalized file");
        trace!("hold file {:p}: {}", self.ptr, prev + 1);
        FileRef { ptr: self.ptr }
    }

    /// Releases this reference, returning whether it finalized the file.
    pub fn release(self) -> bool {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` owns a reference and is never used again.
        unsafe { Self::release_raw(this.ptr) }
    }

    /// Checks whether both references point at the same file.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    pub(crate) fn as_non_null(&self) -> NonNull<File> {
        self.ptr
    }

    /// Acquires a reference unless the file has already been finalized.
    ///
    /// # Safety
    /// `ptr` must point at a file whose memory stays allocated for the duration of the call.
    pub(crate) unsafe fn try_hold(ptr: NonNull<File>) -> Option<FileRef> {
        // SAFETY: guaranteed by the caller.
        let file = unsafe { ptr.as_ref() };
        let mut count = file.count.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return None;
            }
            match file.count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    trace!("hold file {:p}: {}", ptr, count + 1);
                    return Some(FileRef { ptr });
                }
                Err(actual) => count = actual,
            }
        }
    }

    /// # Safety
    /// The caller must own the reference being released.
    unsafe fn release_raw(ptr: NonNull<File>) -> bool {
        // SAFETY: the caller's reference keeps the file allocated.
        let file = unsafe { ptr.as_ref() };
        let prev = file.count.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "file {:p} reference count underflow", ptr);
        if prev != 1 {
            trace!("release file {:p}: {}", ptr, prev - 1);
            return false;
        }
        fence(Ordering::Acquire);

        file.finalize();
        // SAFETY: the pin shared by all references is ours now that none are left.
        unsafe { File::unpin(ptr) };
        true
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        self.hold()
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        // SAFETY: `self` owns a reference and is never used again.
        unsafe { Self::release_raw(self.ptr) };
    }
}

impl Deref for FileRef {
    type Target = File;

    fn deref(&self) -> &File {
        // SAFETY: a reference keeps the file allocated and not yet finalized.
        unsafe { self.ptr.as_ref() }
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
