use derive_more::Deref;
use thiserror::Error;

/// Minimum size of a page.
const PAGE_SIZE_MIN: u32 = 512;
/// Maximum size of a page.
const PAGE_SIZE_MAX: u32 = 65536;
/// Stored value standing in for [`PAGE_SIZE_MAX`], which does not fit in the two byte field.
const PAGE_SIZE_MAX_MARKER: u16 = 1;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PageSizeError {
    #[error("page size must be between 512 and 65536 inclusive (found {0})")]
    NotInRange(u32),
    #[error("page size must be a power of two (found {0})")]
    NotPowerOfTwo(u32),
}

/// Size of a database page, validated to be a power of two within the supported range.
#[derive(Clone, Copy, Debug, Deref, PartialEq, Eq)]
pub struct PageSize(u32);

impl PageSize {
    /// Page size used when the stored one cannot be trusted.
    pub const DEFAULT: Self = Self(4096);

    /// Interpret the two byte value stored in the file header.
    pub fn from_stored(value: u16) -> Result<Self, PageSizeError> {
        if value == PAGE_SIZE_MAX_MARKER {
            return Ok(Self(PAGE_SIZE_MAX));
        }

        Self::try_from(value as u32)
    }
}

impl TryFrom<u32> for PageSize {
    type Error = PageSizeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if !(PAGE_SIZE_MIN..=PAGE_SIZE_MAX).contains(&value) {
            return Err(PageSizeError::NotInRange(value));
        }

        if !value.is_power_of_two() {
            return Err(PageSizeError::NotPowerOfTwo(value));
        }

        Ok(Self(value))
    }
}

impl From<PageSize> for usize {
    fn from(size: PageSize) -> Self {
        size.0 as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rstest::*;

    #[rstest]
    #[case::min(512)]
    #[case(1024)]
    #[case(4096)]
    #[case(16384)]
    #[case(32768)]
    fn good(#[case] raw: u16) {
        let page_size = PageSize::from_stored(raw).expect("valid page size");
        assert_eq!(*page_size, raw as u32);
    }

    #[test]
    fn one() {
        let page_size = PageSize::from_stored(1).expect("valid page size");
        assert_eq!(*page_size, 65536);
    }

    #[rstest]
    #[case::zero(0, |e| matches!(e, PageSizeError::NotInRange(_)))]
    #[case::small(256, |e| matches!(e, PageSizeError::NotInRange(_)))]
    #[case::non_power(1234, |e| matches!(e, PageSizeError::NotPowerOfTwo(_)))]
    #[case::odd_big(65535, |e| matches!(e, PageSizeError::NotPowerOfTwo(_)))]
    fn bad(#[case] raw: u16, #[case] matcher: fn(PageSizeError) -> bool) {
        let error = PageSize::from_stored(raw).expect_err("should be error test");
        assert!(matcher(error));
    }

    #[test]
    fn forced_too_large() {
        assert_eq!(
            PageSize::try_from(131072),
            Err(PageSizeError::NotInRange(131072))
        );
    }
}
