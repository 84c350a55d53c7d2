
use std::{
    any::Any,
    ptr::NonNull,
    sync::atomic::Ordering,
};

use crossbeam_epoch::{self as epoch, Atomic, Shared};
use log::{debug, trace};
use once_cell::sync::Lazy;

use crate::{
    error::{Error, Result},
    file::{File, FileOps, FileRef, FileType, OpenFlags},
};

/// Number of slots in the global table.
pub const FDMAX: usize = 0x4000;

/// A small integer naming a file in a [FileTable].
pub type Fd = i32;

static FILES: Lazy<FileTable> = Lazy::new(|| FileTable::with_capacity(FDMAX));

/// Returns the table shared by the whole kernel.
pub fn files() -> &'static FileTable {
    &FILES
}

/// A fixed-capacity table mapping descriptors to files.
///
/// Slots are claimed and cleared with single atomic operations, so every operation is lock-free.
/// A slot pins the memory of the file it names but does not hold a reference: the reference
/// count and the slot are managed independently. A file that was finalized while a slot still
/// names it can no longer be looked up.
pub struct FileTable {
    slots: Box<[Atomic<File>]>,
}

impl FileTable {
    /// Constructs an empty table with `capacity` slots.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or does not fit in an [Fd].
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity != 0, "a file table needs at least one slot");
        assert!(
            Fd::try_from(capacity).is_ok(),
            "'capacity' must be addressable by a descriptor"
        );
        let slots = (0..capacity).map(|_| Atomic::null()).collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of occupied slots.
    pub fn occupied(&self) -> usize {
        let guard = &epoch::pin();
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Relaxed, guard).is_null())
            .count()
    }

    fn slot(&self, fd: Fd) -> Result<&Atomic<File>> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.slots.get(index))
            .ok_or(Error::BadDescriptor)
    }

    /// Publishes `fp` in the lowest free slot, returning its descriptor.
    pub fn allocate(&self, fp: &FileRef) -> Result<Fd> {
        let guard = &epoch::pin();
        let new = shared(fp);
        fp.pin();

        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.load(Ordering::Relaxed, guard).is_null() {
                continue;
            }
            // A lost race means another file took the slot, keep scanning.
            if slot
                .compare_exchange(
                    Shared::null(),
                    new,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    guard,
                )
                .is_ok()
            {
                trace!("file {:p} published at {}", new.as_raw(), index);
                return Ok(index as Fd);
            }
        }

        // SAFETY: the pin taken above is ours, and `fp` keeps another one.
        unsafe { File::unpin(fp.as_non_null()) };
        debug!("file table is full ({} slots)", self.capacity());
        Err(Error::TooManyOpenFiles)
    }

    /// Publishes `fp` at `fd`, failing if the slot is taken.
    pub fn set_at(&self, fd: Fd, fp: &FileRef) -> Result<()> {
        let slot = self.slot(fd)?;
        let guard = &epoch::pin();
        fp.pin();

        match slot.compare_exchange(
            Shared::null(),
            shared(fp),
            Ordering::AcqRel,
            Ordering::Relaxed,
            guard,
        ) {
            Ok(_) => {
                trace!("file {:p} published at {}", fp.as_non_null(), fd);
                Ok(())
            }
            Err(_) => {
                // SAFETY: the pin taken above is ours, and `fp` keeps another one.
                unsafe { File::unpin(fp.as_non_null()) };
                Err(Error::BadDescriptor)
            }
        }
    }

    /// Clears the slot at `fd`, returning a reference to the file it named, or `None` if that
    /// file was already finalized.
    ///
    /// # Panics
    /// Panics if `fd` is out of range or the slot is empty.
    pub fn free(&self, fd: Fd) -> Option<FileRef> {
        let Ok(slot) = self.slot(fd) else {
            panic!("freeing out-of-range file descriptor {fd}");
        };
        let guard = &epoch::pin();
        let old = slot.swap(Shared::null(), Ordering::AcqRel, guard);
        let Some(ptr) = NonNull::new(old.as_raw() as *mut File) else {
            panic!("freeing unused file descriptor {fd}");
        };
        debug!("freed descriptor {} of file {:p}", fd, ptr);

        // SAFETY: the slot's pin keeps the file allocated until it is dropped below.
        let fp = unsafe { FileRef::try_hold(ptr) };
        // SAFETY: the slot's pin moved to us with the swap.
        unsafe { File::unpin(ptr) };
        fp
    }

    /// Returns a new reference to the file named by `fd`.
    pub fn lookup(&self, fd: Fd) -> Result<FileRef> {
        let slot = self.slot(fd)?;
        let guard = &epoch::pin();
        let current = slot.load(Ordering::Acquire, guard);
        let ptr = NonNull::new(current.as_raw() as *mut File).ok_or(Error::BadDescriptor)?;
        // SAFETY: memory is destroyed only after no slot names the file, and through the epoch
        // pinned above, so the file stays allocated while `guard` lives.
        unsafe { FileRef::try_hold(ptr) }.ok_or(Error::BadDescriptor)
    }

    /// Looks up `fd` and calls `f` with the file, releasing the reference afterwards.
    pub fn with_file<T, F>(&self, fd: Fd, f: F) -> Result<T>
    where
        F: FnOnce(&File) -> Result<T>,
    {
        let fp = self.lookup(fd)?;
        f(&fp)
    }

    /// Allocates a file, initializes it, and publishes it.
    ///
    /// Returns the open reference together with the descriptor. If initialization or
    /// publication fails the file is released before the error is returned.
    pub fn falloc<T: Any + Send>(
        &self,
        flags: OpenFlags,
        ftype: FileType,
        data: T,
        ops: &'static dyn FileOps,
    ) -> Result<(FileRef, Fd)> {
        let fp = File::allocate()?;
        fp.initialize(flags, ftype, data, ops)?;
        let fd = self.allocate(&fp)?;
        debug!("opened {:?} file at {}", ftype, fd);
        Ok((fp, fd))
    }

    /// Publishes the file named by `fd` under the lowest free descriptor.
    ///
    /// Returns the new descriptor's open reference together with the descriptor.
    pub fn dup(&self, fd: Fd) -> Result<(FileRef, Fd)> {
        let fp = self.lookup(fd)?;
        let new_fd = self.allocate(&fp)?;
        Ok((fp, new_fd))
    }

    /// Publishes the file named by `fd` under `new_fd`, which must be free.
    ///
    /// Returns the open reference of `new_fd`. When both descriptors are equal nothing is
    /// published and the returned reference is an extra one.
    pub fn dup_to(&self, fd: Fd, new_fd: Fd) -> Result<FileRef> {
        let fp = self.lookup(fd)?;
        if fd != new_fd {
            self.set_at(new_fd, &fp)?;
        }
        Ok(fp)
    }

    /// Closes `fd`: clears its slot and drops its open reference `fp`.
    ///
    /// Returns whether the file was finalized.
    ///
    /// # Panics
    /// Panics if `fd` is unused or names a different file than `fp`.
    pub fn close(&self, fd: Fd, fp: FileRef) -> bool {
        if let Some(occupant) = self.free(fd) {
            assert!(
                FileRef::ptr_eq(&occupant, &fp),
                "descriptor {fd} closed with a reference to another file"
            );
        }
        fp.release()
    }
}

impl Drop for FileTable {
    fn drop(&mut self) {
        let guard = &epoch::pin();
        for slot in self.slots.iter() {
            let old = slot.swap(Shared::null(), Ordering::AcqRel, guard);
            if let Some(ptr) = NonNull::new(old.as_raw() as *mut File) {
                // SAFETY: the slot's pin moved to us with the swap.
                unsafe { File::unpin(ptr) };
            }
        }
    }
}

fn shared<'g>(fp: &FileRef) -> Shared<'g, File> {
    Shared::from(fp.as_non_null().as_ptr() as *const File)
}
