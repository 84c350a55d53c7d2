use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A file object could not be allocated.
    NoMemory,
    /// Every slot of the table is occupied.
    TooManyOpenFiles,
    /// The handle is out of range, unused, already taken, or names a finalized object.
    BadDescriptor,
    /// The file type does not support the operation.
    InvalidArgument,

    /// A type-specific error passed through unchanged.
    Errno(libc::c_int),
}

impl From<libc::c_int> for Error {
    fn from(errno: libc::c_int) -> Self {
        match errno {
            libc::ENOMEM => Self::NoMemory,
            libc::EMFILE => Self::TooManyOpenFiles,
            libc::EBADF => Self::BadDescriptor,
            libc::EINVAL => Self::InvalidArgument,
            errno => Self::Errno(errno),
        }
    }
}

impl From<Error> for libc::c_int {
    fn from(err: Error) -> Self {
        match err {
            Error::NoMemory => libc::ENOMEM,
            Error::TooManyOpenFiles => libc::EMFILE,
            Error::BadDescriptor => libc::EBADF,
            Error::InvalidArgument => libc::EINVAL,
            Error::Errno(errno) => errno,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errno = libc::c_int::from(*self);
        write!(f, "{}", std::io::Error::from_raw_os_error(errno))
    }
}

impl std::error::Error for Error {}
