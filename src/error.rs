#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free run of the requested length in any eligible window.
    OutOfMemory,
    /// Zero-sized or otherwise unservable request.
    InvalidSize,
    /// The address belongs to neither window or to no live allocation.
    UnknownAddress(usize),
    /// The address is not aligned the way the owning layer requires.
    Misaligned(usize),
    /// A bookkeeping bit for this address was already clear; double free or a
    /// guessed pointer. State is left untouched.
    DoubleFree(usize),
    /// The window configuration handed to `manage` is unusable.
    BadConfig(&'static str),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::InvalidSize => write!(f, "invalid allocation size"),
            Error::UnknownAddress(addr) => write!(f, "unknown address `{addr:#x}`"),
            Error::Misaligned(addr) => write!(f, "misaligned address `{addr:#x}`"),
            Error::DoubleFree(addr) => write!(f, "double free at `{addr:#x}`"),
            Error::BadConfig(what) => write!(f, "bad window configuration: {what}"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
