//! The global file descriptor table of a single-address-space kernel.
//!
//! Every thread of the kernel shares one [FileTable], reached through [files]. A descriptor names
//! a reference-counted [File]; the file's [FileOps] decide what reading, writing, polling and
//! closing it mean.

pub mod error;
pub mod file;
pub mod poll;
pub mod table;

pub use error::{Error, Result};
pub use file::{
    BAD_FILE_OPS, BadFileOps, File, FileOps, FileRef, FileStat, FileState, FileType, Lifecycle,
    OpenFlags,
};
pub use poll::{PollEvents, PollWaiter};
pub use table::{FDMAX, Fd, FileTable, files};
