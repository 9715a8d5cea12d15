use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};

/// Length of a ULID in its canonical Crockford base32 form.
pub const EID_LEN: usize = 26;

/// Row identifier. The store orders rows by id. ULIDs from different
/// milliseconds sort by creation time; within one millisecond the order
/// is arbitrary but stable.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct Eid(String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Eid {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Eid(s.to_string()))
    }
}

impl Deref for Eid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(fr: &str) -> Self {
        Eid(fr.to_string())
    }
}

impl From<String> for Eid {
    fn from(fr: String) -> Self {
        Eid(fr)
    }
}

impl From<Eid> for String {
    fn from(fr: Eid) -> Self {
        fr.0
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(rusty_ulid::Ulid::generate().to_string())
    }

    /// Fixed-width byte form used by the vector file.
    /// Returns `None` for ids that are not canonical ULIDs.
    pub fn to_fixed_bytes(&self) -> Option<[u8; EID_LEN]> {
        self.0.as_bytes().try_into().ok()
    }

    pub fn from_fixed_bytes(bytes: &[u8; EID_LEN]) -> Option<Eid> {
        std::str::from_utf8(bytes).ok().map(Eid::from)
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}
