//! Address lifecycle: create, read, update, delete.
//!
//! Each operation is a fixed sequence of lookups and IPAM calls executed in
//! order; a failing step aborts the operation with an error naming that
//! step. Nothing is retried except the release of a replaced address during
//! reallocation, which gets one second attempt before the leak is reported.
//!
//! Only [`Orchestrator::create`] takes the [`AllocationGuard`]: it is the
//! one path that competes for free addresses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::IpamApi;
use crate::error::{Error, Result};
use crate::guard::AllocationGuard;
use crate::resolver;

/// Where an address should live and what it is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    /// Section name.
    pub section: String,
    /// Subnet description.
    pub subnet: String,
    pub hostname: String,
}

impl AddressSpec {
    pub fn new(
        section: impl Into<String>,
        subnet: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            section: section.into(),
            subnet: subnet.into(),
            hostname: hostname.into(),
        }
    }

    /// True when `other` targets a different section or subnet.
    pub fn placement_differs(&self, other: &AddressSpec) -> bool {
        self.section != other.section || self.subnet != other.subnet
    }
}

/// Denormalized view of an address and its subnet and section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub hostname: String,
    pub ip: String,
    pub section: String,
    pub subnet: String,
    pub broadcast: String,
    pub gateway: String,
    pub bitmask: String,
}

impl AddressRecord {
    pub fn spec(&self) -> AddressSpec {
        AddressSpec::new(&self.section, &self.subnet, &self.hostname)
    }
}

/// Runs address lifecycle operations against one IPAM backend.
///
/// Each instance owns its own [`AllocationGuard`], so independent
/// orchestrators never block each other.
pub struct Orchestrator {
    client: Arc<dyn IpamApi>,
    guard: AllocationGuard,
    owner: String,
}

impl Orchestrator {
    /// `owner` tags every address this orchestrator allocates.
    pub fn new(client: Arc<dyn IpamApi>, owner: impl Into<String>) -> Self {
        Self {
            client,
            guard: AllocationGuard::new(),
            owner: owner.into(),
        }
    }

    pub fn guard(&self) -> &AllocationGuard {
        &self.guard
    }

    /// Allocates the first free address of the target subnet to the hostname
    /// and returns the new address identifier.
    ///
    /// Allocation proceeds when the hostname owns no address, or owns exactly
    /// one and `force_replace` is set (the reallocation path of
    /// [`Orchestrator::update`]).
    ///
    /// # Errors
    ///
    /// - [`Error::GettingSectionId`] / [`Error::GettingSubnetId`] when a lookup fails
    /// - [`Error::FindingExistingAddresses`] when the hostname search fails
    /// - [`Error::AddressAlreadyAllocated`] when the existing count forbids allocation
    /// - [`Error::AllocatingNewAddress`] when the first-free call fails
    /// - [`Error::GettingCreatedAddressId`] when the new IP does not map to one record
    pub async fn create(&self, spec: &AddressSpec, force_replace: bool) -> Result<String> {
        let _permit = self.guard.acquire().await;
        let client = self.client.as_ref();

        let section_id = resolver::resolve_section(client, &spec.section)
            .await
            .map_err(|error| Error::GettingSectionId(Box::new(error)))?;

        let subnet_id = resolver::resolve_subnet(client, &section_id, &spec.subnet)
            .await
            .map_err(|error| Error::GettingSubnetId(Box::new(error)))?;

        let (count, _) = resolver::find_by_hostname(client, &spec.hostname)
            .await
            .map_err(|error| Error::FindingExistingAddresses(Box::new(error)))?;

        if !(count == 0 || (count == 1 && force_replace)) {
            return Err(Error::AddressAlreadyAllocated {
                hostname: spec.hostname.clone(),
                count,
            });
        }

        debug!(
            "New address section ID: {}, subnet ID: {}",
            section_id, subnet_id
        );
        let allocation = client
            .create_first_free(&subnet_id, &spec.hostname, &self.owner)
            .await
            .map_err(|error| Error::AllocatingNewAddress(Error::boxed(error)))?;

        if !allocation.is_success() {
            return Err(Error::AllocatingNewAddress(Box::new(allocation.api_error())));
        }
        let ip = allocation.data.ok_or_else(|| {
            Error::AllocatingNewAddress(Box::new(Error::Api {
                code: allocation.code,
                message: "allocation returned no address".to_string(),
            }))
        })?;

        let id = resolver::find_id_by_ip(client, &ip)
            .await
            .map_err(|error| Error::GettingCreatedAddressId {
                ip: ip.clone(),
                source: Box::new(error),
            })?;

        info!("New address allocated: {} ({}) for {}", ip, id, spec.hostname);
        Ok(id)
    }

    /// Fetches the address, its subnet and the subnet's section.
    ///
    /// # Errors
    ///
    /// [`Error::AddressNotFound`], [`Error::AddressSubnetNotFound`] or
    /// [`Error::SubnetSectionNotFound`] when the respective fetch reports a
    /// non-success status, and [`Error::Client`] when a call fails.
    pub async fn read(&self, address_id: &str) -> Result<AddressRecord> {
        let response = self.client.get_address(address_id).await?;
        if !response.is_ok() {
            return Err(Error::AddressNotFound(address_id.to_string()));
        }
        let address = response
            .data
            .ok_or_else(|| Error::AddressNotFound(address_id.to_string()))?;

        let response = self.client.get_subnet(&address.subnet_id).await?;
        if !response.is_ok() {
            return Err(Error::AddressSubnetNotFound(address.subnet_id));
        }
        let subnet = response
            .data
            .ok_or_else(|| Error::AddressSubnetNotFound(address.subnet_id.clone()))?;

        let response = self.client.get_section(&subnet.section_id).await?;
        if !response.is_ok() {
            return Err(Error::SubnetSectionNotFound(subnet.section_id));
        }
        let section = response
            .data
            .ok_or_else(|| Error::SubnetSectionNotFound(subnet.section_id.clone()))?;

        Ok(AddressRecord {
            broadcast: subnet.broadcast(),
            gateway: subnet.gateway_ip(),
            bitmask: subnet.bitmask(),
            hostname: address.hostname,
            ip: address.ip,
            section: section.name,
            subnet: subnet.description,
        })
    }

    /// Moves the address at `address_id` from `current` to `desired` and
    /// returns the (possibly new) identifier with a fresh record.
    ///
    /// Callers that must not lose the identifier when the final read fails
    /// should call [`Orchestrator::modify`] and [`Orchestrator::read`]
    /// separately.
    pub async fn update(
        &self,
        address_id: &str,
        current: &AddressSpec,
        desired: &AddressSpec,
    ) -> Result<(String, AddressRecord)> {
        let id = self.modify(address_id, current, desired).await?;
        let record = self.read(&id).await?;
        Ok((id, record))
    }

    /// Applies the mutation half of [`Orchestrator::update`] and returns the
    /// identifier now holding the address.
    ///
    /// A section or subnet change reallocates: a new address is created with
    /// `force_replace`, then the old one is released without a liveness
    /// check. A hostname-only change renames in place and keeps the
    /// identifier. Otherwise nothing is called.
    ///
    /// # Errors
    ///
    /// [`Error::ReallocationIncomplete`] when the new address was created but
    /// the old one could not be released after a second attempt. The error
    /// carries the new identifier.
    pub async fn modify(
        &self,
        address_id: &str,
        current: &AddressSpec,
        desired: &AddressSpec,
    ) -> Result<String> {
        if current.placement_differs(desired) {
            self.reallocate(address_id, desired).await
        } else if current.hostname != desired.hostname {
            self.rename(address_id, &desired.hostname).await?;
            Ok(address_id.to_string())
        } else {
            Ok(address_id.to_string())
        }
    }

    async fn rename(&self, address_id: &str, hostname: &str) -> Result<()> {
        let response = self
            .client
            .update_hostname(address_id, hostname)
            .await
            .map_err(|error| Error::AddressUpdateFailed(Error::boxed(error)))?;

        if !response.is_ok() {
            return Err(Error::AddressUpdateFailed(Box::new(response.api_error())));
        }

        info!("Address {} renamed to {}", address_id, hostname);
        Ok(())
    }

    async fn reallocate(&self, old_id: &str, desired: &AddressSpec) -> Result<String> {
        let new_id = self.create(desired, true).await?;

        if let Err(error) = self.delete(old_id, true).await {
            warn!(
                "Releasing replaced address {} failed, retrying once: {}",
                old_id, error
            );
            if let Err(cause) = self.delete(old_id, true).await {
                return Err(Error::ReallocationIncomplete {
                    old_id: old_id.to_string(),
                    new_id,
                    cause: Box::new(cause),
                });
            }
        }

        info!("Address {} reallocated as {}", old_id, new_id);
        Ok(new_id)
    }

    /// Releases the address.
    ///
    /// Unless `force_release` is set, the address is probed first and a host
    /// that still answers is left allocated.
    ///
    /// # Errors
    ///
    /// - [`Error::LivelinessCheckFailed`] when the probe cannot complete
    /// - [`Error::AddressStillLive`] when the probe reports the host reachable
    /// - [`Error::DeleteAddressFailed`] when the release fails
    pub async fn delete(&self, address_id: &str, force_release: bool) -> Result<()> {
        if !force_release {
            let probe = self
                .client
                .ping_address(address_id)
                .await
                .map_err(|error| Error::LivelinessCheckFailed(Error::boxed(error)))?;

            if probe.is_ok() {
                return Err(Error::AddressStillLive(address_id.to_string()));
            }
        }

        let response = self
            .client
            .delete_address(address_id)
            .await
            .map_err(|error| Error::DeleteAddressFailed(Error::boxed(error)))?;

        if !response.is_ok() {
            return Err(Error::DeleteAddressFailed(Box::new(response.api_error())));
        }

        info!("Address removed: {}", address_id);
        Ok(())
    }
}
