//! Fixed-capacity string and byte containers.
//!
//! Every variable-length field that crosses the UAM boundary (usernames,
//! URLs, RADIUS State/Class) is held in one of these. Construction fails when
//! the input exceeds the capacity; nothing is ever truncated.

use crate::error::FieldError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// A UTF-8 string of at most `N` bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoundedString<const N: usize>(String);

impl<const N: usize> BoundedString<N> {
    pub const CAPACITY: usize = N;

    pub fn new(field: &'static str, value: impl Into<String>) -> Result<Self, FieldError> {
        let value = value.into();
        if value.len() > N {
            return Err(FieldError::TooLong {
                field,
                max: N,
                len: value.len(),
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> Deref for BoundedString<N> {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl<const N: usize> TryFrom<String> for BoundedString<N> {
    type Error = FieldError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new("string", value)
    }
}

impl<const N: usize> From<BoundedString<N>> for String {
    fn from(value: BoundedString<N>) -> Self {
        value.0
    }
}

impl<const N: usize> fmt::Debug for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque byte buffer of at most `N` bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct BoundedBytes<const N: usize>(Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    pub const CAPACITY: usize = N;

    pub fn new(field: &'static str, value: impl Into<Vec<u8>>) -> Result<Self, FieldError> {
        let value = value.into();
        if value.len() > N {
            return Err(FieldError::TooLong {
                field,
                max: N,
                len: value.len(),
            });
        }
        Ok(Self(value))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> Deref for BoundedBytes<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> TryFrom<Vec<u8>> for BoundedBytes<N> {
    type Error = FieldError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new("bytes", value)
    }
}

impl<const N: usize> From<BoundedBytes<N>> for Vec<u8> {
    fn from(value: BoundedBytes<N>) -> Self {
        value.0
    }
}

impl<const N: usize> fmt::Debug for BoundedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}
