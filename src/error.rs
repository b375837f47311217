use thiserror::Error;

/// Errors surfaced by the kernel debug-info discovery subsystem.
///
/// Callers that only need a human-readable chain should prefer
/// `eyre::Result` at their own call sites; this enum exists so code
/// that must distinguish kinds (e.g. to drive a kernel-version
/// fallback on `Lookup`) can match on it.
#[derive(Error, Debug)]
pub enum Error {
    /// A syscall (`open`, `read`, `stat`, `mmap`, `readdir`, ...) failed.
    #[error("{syscall} failed on {context}: {errno}")]
    Os {
        syscall: &'static str,
        errno: std::io::Error,
        context: String,
    },

    /// A numeric field failed to parse, overflowed its target width, or
    /// left trailing bytes unconsumed.
    #[error("numeric overflow parsing {0:?}")]
    Overflow(String),

    /// Allocation failure. Always fatal.
    #[error("out of memory")]
    NoMemory,

    /// A named symbol or struct member was not present.
    ///
    /// Drives the kernel-version fallbacks in the module iterator and
    /// section iterator: a `Lookup` on the first probe of a versioned
    /// field means "try the older layout", not "abort".
    #[error("{0} not found")]
    Lookup(String),

    /// Malformed VMCOREINFO, `/proc/modules`, depmod index, ELF note,
    /// or section metadata, with a human-readable description
    /// (including the byte offset, where applicable).
    #[error("{0}")]
    Other(String),

    /// Control-flow signal: a module name was not present in the
    /// depmod index or the user-supplied build-ID table. Never
    /// escapes its immediate caller.
    #[error("not found")]
    NotFound,

    /// Control-flow signal: iterator exhaustion. Never escapes its
    /// immediate caller.
    #[error("stop")]
    Stop,
}

impl Error {
    pub fn os(syscall: &'static str, errno: std::io::Error, context: impl Into<String>) -> Self {
        Error::Os {
            syscall,
            errno,
            context: context.into(),
        }
    }

    /// `NoMemory` is always fatal; every other non-control-flow kind
    /// is reported per-file and may be swallowed by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoMemory)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
