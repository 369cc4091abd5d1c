//! Error types for parsing resource fields.

use thiserror::Error;

use crate::version::{ReleaseSeries, Version};

/// Errors raised while parsing values out of a cluster spec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The image reference carries no tag to read a version from.
    #[error("image {0:?} has no version tag")]
    MissingTag(String),

    /// The version string is not `vMAJOR.MINOR.PATCH`.
    #[error("malformed version {0:?}, expected vMAJOR.MINOR.PATCH")]
    MalformedVersion(String),

    /// The storage quantity could not be parsed.
    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),
}

/// A requested version change that the database cannot perform in one step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpgradePathError {
    /// The requested version is older than the running one.
    #[error("downgrade from {from} to {to} is not supported")]
    Downgrade { from: Version, to: Version },

    /// The request skips one or more release series.
    #[error("upgrade from {from} to {to} skips release series {required}")]
    SkipsSeries {
        from: Version,
        to: Version,
        required: ReleaseSeries,
    },
}
