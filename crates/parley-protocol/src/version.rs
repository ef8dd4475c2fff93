//! Protocol versioning for Parley.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version, advertised in the `connected` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Breaking changes increment this.
    pub major: u8,
    /// Additive changes (new optional fields, new events) increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Clients speaking the same major version can talk to each other.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').ok_or("Version must look like MAJOR.MINOR")?;
        let major = major.parse().map_err(|_| "Invalid major version")?;
        let minor = minor.parse().map_err(|_| "Invalid minor version")?;
        Ok(Self { major, minor })
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
