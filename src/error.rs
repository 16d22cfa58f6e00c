use core::fmt;

/// Why an allocation could not be satisfied.
///
/// Whichever variant is returned, the allocator is left exactly as it was
/// before the call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// A descriptor pool could not grow because host memory ran out.
    DescriptorExhausted,
    /// The region provider could not create or map a new backing region.
    BackingAllocationFailed,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::DescriptorExhausted => {
                write!(f, "out of host memory for block descriptors")
            }
            AllocError::BackingAllocationFailed => {
                write!(f, "could not create or map a backing region for shader code")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}
