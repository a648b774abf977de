//! Kernel-wide error taxonomy
//!
//! Every public entry point in the core returns one of these kinds; callers
//! surface the kind to their own caller. Conditions that cannot be reduced
//! to an error kind (double fault, unhandled exception) are fatal and go
//! through the panic path instead.

use core::fmt;

/// Kernel error kind
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// Invalid parameter or argument (bad vector, misaligned address, ...)
    InvalidArg,

    /// Physical memory exhausted
    OutOfMemory,

    /// Fixed-capacity table is full
    Resource,

    /// Lookup miss (translate, unmap, service lookup)
    NotPresent,

    /// Resource busy or in use
    Busy,

    /// Required hardware was not detected (APIC, IO-APIC)
    HardwareAbsent,
}

impl KernelError {
    /// Get error code for logging
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidArg => 1,
            Self::OutOfMemory => 2,
            Self::Resource => 3,
            Self::NotPresent => 4,
            Self::Busy => 5,
            Self::HardwareAbsent => 6,
        }
    }

    /// Get error name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidArg => "InvalidArg",
            Self::OutOfMemory => "OutOfMemory",
            Self::Resource => "Resource",
            Self::NotPresent => "NotPresent",
            Self::Busy => "Busy",
            Self::HardwareAbsent => "HardwareAbsent",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidArg => write!(f, "invalid argument"),
            KernelError::OutOfMemory => write!(f, "out of physical memory"),
            KernelError::Resource => write!(f, "resource table full"),
            KernelError::NotPresent => write!(f, "not present"),
            KernelError::Busy => write!(f, "resource busy"),
            KernelError::HardwareAbsent => write!(f, "hardware not detected"),
        }
    }
}

/// Result type for kernel operations
pub type KernelResult<T = ()> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            KernelError::InvalidArg,
            KernelError::OutOfMemory,
            KernelError::Resource,
            KernelError::NotPresent,
            KernelError::Busy,
            KernelError::HardwareAbsent,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn test_name_matches_variant() {
        assert_eq!(KernelError::HardwareAbsent.name(), "HardwareAbsent");
        assert_eq!(KernelError::NotPresent.name(), "NotPresent");
    }
}
