//! Conversion of retrieved device integers into host element types.

use crate::error::{Error, Result};

/// A host type device integers can be cast into.
pub trait HostElement: Sized {
    /// Type tag used in conversion errors.
    const NAME: &'static str;

    fn from_device(value: i32) -> Result<Self>;
}

impl HostElement for i32 {
    const NAME: &'static str = "i32";

    fn from_device(value: i32) -> Result<Self> {
        Ok(value)
    }
}

impl HostElement for i64 {
    const NAME: &'static str = "i64";

    fn from_device(value: i32) -> Result<Self> {
        Ok(i64::from(value))
    }
}

impl HostElement for f64 {
    const NAME: &'static str = "f64";

    fn from_device(value: i32) -> Result<Self> {
        Ok(f64::from(value))
    }
}

impl HostElement for u32 {
    const NAME: &'static str = "u32";

    fn from_device(value: i32) -> Result<Self> {
        u32::try_from(value).map_err(|_| Error::Conversion {
            value,
            target: Self::NAME,
        })
    }
}

/// Convert a whole array, failing on the first value that does not fit.
pub fn cast_all<T: HostElement>(values: &[i32]) -> Result<Vec<T>> {
    values.iter().map(|&v| T::from_device(v)).collect()
}
