//! Error types for address lifecycle management.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Step-specific variants wrap the
//! underlying cause so the rendered message names both the failing step and
//! the reason.

use crate::client::ClientError;

/// Errors that can occur while managing IPAM addresses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (config or state files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or state files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The IPAM call could not be completed.
    #[error("IPAM client error: {0}")]
    Client(#[from] ClientError),

    /// The IPAM service answered with a non-success status code.
    #[error("IPAM API returned code {code}: {message}")]
    Api { code: u16, message: String },

    /// Invalid provider configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No section with the given name exists.
    #[error("Section {0:?} not found")]
    SectionNotFound(String),

    /// No subnet with the given description exists in the section.
    #[error("Subnet {0:?} not found")]
    SubnetNotFound(String),

    /// An IP lookup did not match exactly one address record.
    #[error("Address over allocated: {count} records match {ip}")]
    OverAllocated { ip: String, count: usize },

    #[error("Error getting section ID: {0}")]
    GettingSectionId(#[source] Box<Error>),

    #[error("Error getting subnet ID: {0}")]
    GettingSubnetId(#[source] Box<Error>),

    #[error("Error finding existing addresses: {0}")]
    FindingExistingAddresses(#[source] Box<Error>),

    /// The hostname already owns address records and replacement was not allowed.
    #[error("Address already allocated for {hostname:?}, total found addresses: {count}")]
    AddressAlreadyAllocated { hostname: String, count: usize },

    #[error("Error allocating new address: {0}")]
    AllocatingNewAddress(#[source] Box<Error>),

    #[error("Error getting created address ID for {ip}: {source}")]
    GettingCreatedAddressId {
        ip: String,
        #[source]
        source: Box<Error>,
    },

    /// The address record itself could not be fetched.
    #[error("Address {0} not found")]
    AddressNotFound(String),

    /// The subnet referenced by an address no longer exists.
    #[error("Address subnet {0} not found")]
    AddressSubnetNotFound(String),

    /// The section referenced by a subnet no longer exists.
    #[error("Subnet section {0} not found")]
    SubnetSectionNotFound(String),

    #[error("Address update failed: {0}")]
    AddressUpdateFailed(#[source] Box<Error>),

    #[error("Address liveliness check failed: {0}")]
    LivelinessCheckFailed(#[source] Box<Error>),

    /// The address still answers the liveness probe and was not released.
    #[error("Address {0} host is still live")]
    AddressStillLive(String),

    #[error("Delete address failed: {0}")]
    DeleteAddressFailed(#[source] Box<Error>),

    /// A reallocation created its new address but could not release the old one.
    ///
    /// The old address is leaked upstream and needs manual cleanup. The new
    /// identifier is valid and should be adopted by the caller.
    #[error(
        "Reallocation incomplete: new address {new_id} allocated but {old_id} was not released \
         (manual cleanup required): {cause}"
    )]
    ReallocationIncomplete {
        old_id: String,
        new_id: String,
        #[source]
        cause: Box<Error>,
    },

    /// No resource with the given name is tracked in the state file.
    #[error("Resource {0:?} not found in state")]
    ResourceNotFound(String),
}

impl Error {
    pub(crate) fn boxed(error: impl Into<Error>) -> Box<Error> {
        Box::new(error.into())
    }
}

/// A specialized Result type for address operations.
pub type Result<T> = std::result::Result<T, Error>;
