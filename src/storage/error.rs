//! Common error type for storage operations

/// A common error type for all storage operations.
///
/// This enum defines the error kinds propagated by the translation layers
/// and the journal. It is designed to be simple and portable for `no_std`
/// environments.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// A physical read, program or erase operation failed.
    Io,
    /// On-flash state is inconsistent: uncorrectable ECC error, signature
    /// mismatch or geometry mismatch.
    Corruption,
    /// The device carries no valid low-level format.
    NotFormatted,
    /// No free block or journal entry is available.
    OutOfSpace,
    /// The device is in read-only state; the write was rejected.
    ReadOnly,
    /// An argument is out of range; no side effect took place.
    InvalidArgument,
    /// The transaction open counter reached its design limit.
    TooManyTransactions,
    /// A transaction boundary operation was called with no transaction open.
    NoOpenTransaction,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::Io => defmt::write!(f, "Io"),
            Error::Corruption => defmt::write!(f, "Corruption"),
            Error::NotFormatted => defmt::write!(f, "NotFormatted"),
            Error::OutOfSpace => defmt::write!(f, "OutOfSpace"),
            Error::ReadOnly => defmt::write!(f, "ReadOnly"),
            Error::InvalidArgument => defmt::write!(f, "InvalidArgument"),
            Error::TooManyTransactions => defmt::write!(f, "TooManyTransactions"),
            Error::NoOpenTransaction => defmt::write!(f, "NoOpenTransaction"),
        }
    }
}
