//! Database versions and upgrade paths.
//!
//! CockroachDB versions are `vYY.N.P`: a release series `YY.N` followed by a
//! patch number. A running cluster can move forward by any number of patch
//! releases inside its series, or to the next series, but never skip a series
//! and never go backwards.

use std::fmt;
use std::str::FromStr;

use crate::error::{ParseError, UpgradePathError};

/// A parsed `vMAJOR.MINOR.PATCH` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Read the version from an image reference such as
    /// `cockroachdb/cockroach:v19.2.5`.
    pub fn from_image(image: &str) -> Result<Self, ParseError> {
        if image.contains('@') {
            return Err(ParseError::MissingTag(image.to_string()));
        }

        // The tag separator must come after the last path segment so that
        // registry ports (`host:5000/repo`) are not mistaken for tags.
        let last_segment = image.rsplit('/').next().unwrap_or(image);
        match last_segment.rsplit_once(':') {
            Some((_, tag)) if !tag.is_empty() => tag.parse(),
            _ => Err(ParseError::MissingTag(image.to_string())),
        }
    }

    /// The release series this version belongs to.
    pub fn series(&self) -> ReleaseSeries {
        ReleaseSeries {
            major: self.major,
            minor: self.minor,
        }
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseError::MalformedVersion(s.to_string());

        let trimmed = s.strip_prefix('v').unwrap_or(s);
        // Pre-release and build suffixes do not take part in path decisions.
        let core = trimmed
            .split(['-', '+'])
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(malformed)?;

        let mut parts = core.split('.');
        let mut next = || -> Result<u32, ParseError> {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(malformed)
        };
        let version = Version::new(next()?, next()?, next()?);

        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A release series, `YY.N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseSeries {
    pub major: u32,
    pub minor: u32,
}

impl ReleaseSeries {
    /// Number of release series shipped in a given year.
    fn series_in_year(major: u32) -> u32 {
        match major {
            0..=23 => 2,
            24 => 3,
            _ => 4,
        }
    }

    /// The series a cluster running `self` must upgrade to next.
    pub fn next(&self) -> ReleaseSeries {
        if self.minor < Self::series_in_year(self.major) {
            ReleaseSeries {
                major: self.major,
                minor: self.minor + 1,
            }
        } else {
            ReleaseSeries {
                major: self.major + 1,
                minor: 1,
            }
        }
    }
}

impl fmt::Display for ReleaseSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Kind of a supported version change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePath {
    /// No version change.
    Same,
    /// Patch release inside the running series.
    Patch,
    /// Move to the next release series.
    NextSeries,
}

impl UpgradePath {
    /// Whether the change crosses a series boundary, which requires the
    /// cluster to keep its downgrade option until the upgrade is finalized.
    pub fn changes_series(&self) -> bool {
        matches!(self, Self::NextSeries)
    }
}

/// Decide whether `from -> to` is a supported single-step upgrade.
pub fn upgrade_path(from: &Version, to: &Version) -> Result<UpgradePath, UpgradePathError> {
    if to == from {
        return Ok(UpgradePath::Same);
    }
    if to < from {
        return Err(UpgradePathError::Downgrade {
            from: *from,
            to: *to,
        });
    }
    if to.series() == from.series() {
        return Ok(UpgradePath::Patch);
    }

    let required = from.series().next();
    if to.series() == required {
        Ok(UpgradePath::NextSeries)
    } else {
        Err(UpgradePathError::SkipsSeries {
            from: *from,
            to: *to,
            required,
        })
    }
}
