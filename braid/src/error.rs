//! Status codes and error types shared by the data plane.
//!
//! Internally every in-flight operation carries a small signed status that
//! only ever worsens: the first negative value sticks until the entry is
//! released. The public [`FabricError`] enum is the user-facing view of the
//! same codes.

use thiserror::Error;

/// Wire/entry status codes. Zero is success, negative is an error.
pub mod status {
    pub const OK: i32 = 0;
    /// Message larger than the receive buffer; delivered bytes are valid.
    pub const TRUNCATED: i32 = -1;
    /// Transport completion queue reported a non-success entry.
    pub const IO: i32 = -2;
    /// No local or cached remote registration for the referenced key.
    pub const NO_KEY: i32 = -3;
    /// Peek found no buffered message.
    pub const NO_MSG: i32 = -4;
    /// Entry or buffer allocation failed.
    pub const NO_MEM: i32 = -5;
    /// Completion queue is full.
    pub const NO_SPACE: i32 = -6;
    /// Transient back-pressure; never surfaced to users, always retried.
    pub const AGAIN: i32 = -7;
    /// Unknown wire opcode.
    pub const NOT_IMPLEMENTED: i32 = -8;
}

/// Per-entry status that worsens monotonically: once negative, later updates
/// never overwrite it with a different value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StickyStatus(i32);

impl StickyStatus {
    pub fn new() -> Self {
        StickyStatus(status::OK)
    }

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn is_err(self) -> bool {
        self.0 < 0
    }

    /// Record a failure. Non-negative values and repeat failures are ignored.
    pub fn update(&mut self, s: i32) {
        if s < 0 && self.0 >= 0 {
            self.0 = s;
        }
    }
}

/// User-facing error for control- and data-plane entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FabricError {
    #[error("message truncated, {rem} bytes undelivered")]
    Truncated { rem: u64 },
    #[error("transport I/O error")]
    Io,
    #[error("no registration for memory key")]
    NoKey,
    #[error("no matching message")]
    NoMsg,
    #[error("out of resources")]
    NoMem,
    #[error("completion queue full")]
    NoSpace,
    #[error("resources temporarily exhausted")]
    Again,
    #[error("opcode {0} not implemented")]
    NotImplemented(u8),
}

impl FabricError {
    pub fn to_status(&self) -> i32 {
        match self {
            FabricError::Truncated { .. } => status::TRUNCATED,
            FabricError::Io => status::IO,
            FabricError::NoKey => status::NO_KEY,
            FabricError::NoMsg => status::NO_MSG,
            FabricError::NoMem => status::NO_MEM,
            FabricError::NoSpace => status::NO_SPACE,
            FabricError::Again => status::AGAIN,
            FabricError::NotImplemented(_) => status::NOT_IMPLEMENTED,
        }
    }

    pub fn from_status(s: i32, rem: u64) -> Option<FabricError> {
        match s {
            status::TRUNCATED => Some(FabricError::Truncated { rem }),
            status::IO => Some(FabricError::Io),
            status::NO_KEY => Some(FabricError::NoKey),
            status::NO_MSG => Some(FabricError::NoMsg),
            status::NO_MEM => Some(FabricError::NoMem),
            status::NO_SPACE => Some(FabricError::NoSpace),
            status::AGAIN => Some(FabricError::Again),
            s if s < 0 => Some(FabricError::Io),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sticky_status_monotonic() {
        let mut s = StickyStatus::new();
        assert_eq!(s.get(), status::OK);

        s.update(status::OK);
        assert_eq!(s.get(), status::OK);

        s.update(status::TRUNCATED);
        assert_eq!(s.get(), status::TRUNCATED);

        // Later failures do not overwrite the first one.
        s.update(status::IO);
        assert_eq!(s.get(), status::TRUNCATED);

        // Success never clears a failure.
        s.update(status::OK);
        assert_eq!(s.get(), status::TRUNCATED);
    }

    #[test]
    fn test_status_error_roundtrip() {
        for s in [
            status::TRUNCATED,
            status::IO,
            status::NO_KEY,
            status::NO_MSG,
            status::NO_MEM,
            status::NO_SPACE,
            status::AGAIN,
        ] {
            let err = FabricError::from_status(s, 0).unwrap();
            assert_eq!(err.to_status(), s);
        }
        assert!(FabricError::from_status(status::OK, 0).is_none());
    }
}
