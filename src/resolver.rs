//! Name and address lookups.
//!
//! Sections and subnets are addressed by humans through their name and
//! description; the API wants identifiers. These lookups list the candidates
//! and scan them linearly. Matching is exact and case-sensitive, and the
//! first match wins when names repeat.

use tracing::debug;

use crate::client::IpamApi;
use crate::error::{Error, Result};
use crate::models::Address;

/// Returns the identifier of the section named `name`.
///
/// # Errors
///
/// [`Error::SectionNotFound`] when no section carries the name,
/// [`Error::Api`] when the listing is refused, or [`Error::Client`] when it
/// cannot be fetched.
pub async fn resolve_section(client: &dyn IpamApi, name: &str) -> Result<String> {
    let sections = client.list_sections().await?.into_records()?;

    let id = sections
        .into_iter()
        .find(|section| section.name == name)
        .map(|section| section.id)
        .ok_or_else(|| Error::SectionNotFound(name.to_string()))?;

    debug!("Section {:?} resolved to {}", name, id);
    Ok(id)
}

/// Returns the identifier of the subnet described as `description` within
/// the section `section_id`.
pub async fn resolve_subnet(
    client: &dyn IpamApi,
    section_id: &str,
    description: &str,
) -> Result<String> {
    let subnets = client
        .list_section_subnets(section_id)
        .await?
        .into_records()?;

    let id = subnets
        .into_iter()
        .find(|subnet| subnet.description == description)
        .map(|subnet| subnet.id)
        .ok_or_else(|| Error::SubnetNotFound(description.to_string()))?;

    debug!("Subnet {:?} resolved to {}", description, id);
    Ok(id)
}

/// Returns every address registered for `hostname` along with the raw count.
///
/// The count is left for the caller to interpret: 0 means the hostname is
/// free, 1 that it is allocated, more than 1 an inconsistent state.
pub async fn find_by_hostname(
    client: &dyn IpamApi,
    hostname: &str,
) -> Result<(usize, Vec<Address>)> {
    let addresses = client.search_hostname(hostname).await?.into_records()?;
    Ok((addresses.len(), addresses))
}

/// Returns the identifier of the single address record holding `ip`.
///
/// # Errors
///
/// [`Error::OverAllocated`] unless exactly one record matches.
pub async fn find_id_by_ip(client: &dyn IpamApi, ip: &str) -> Result<String> {
    let mut addresses = client.search_ip(ip).await?.into_records()?;

    if addresses.len() != 1 {
        return Err(Error::OverAllocated {
            ip: ip.to_string(),
            count: addresses.len(),
        });
    }

    Ok(addresses.remove(0).id)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::memory::{MemoryIpam, Operation};

    #[tokio::test]
    async fn test_resolve_section_exact_match() {
        let ipam = MemoryIpam::new();
        let id = ipam.add_section("Customers");

        assert_eq!(resolve_section(&ipam, "Customers").await.unwrap(), id);
        assert!(matches!(
            resolve_section(&ipam, "customers").await,
            Err(Error::SectionNotFound(name)) if name == "customers"
        ));
        assert!(matches!(
            resolve_section(&ipam, "Customers ").await,
            Err(Error::SectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_names_first_match_wins() {
        let ipam = MemoryIpam::new();
        let first = ipam.add_section("Lab");
        let _second = ipam.add_section("Lab");

        assert_eq!(resolve_section(&ipam, "Lab").await.unwrap(), first);

        let first_subnet = ipam.add_subnet(&first, Ipv4Addr::new(10, 0, 0, 0), 24, "servers");
        let _second_subnet = ipam.add_subnet(&first, Ipv4Addr::new(10, 0, 1, 0), 24, "servers");
        assert_eq!(
            resolve_subnet(&ipam, &first, "servers").await.unwrap(),
            first_subnet
        );
    }

    #[tokio::test]
    async fn test_resolve_subnet_scoped_to_section() {
        let ipam = MemoryIpam::new();
        let lab = ipam.add_section("Lab");
        let prod = ipam.add_section("Prod");
        ipam.add_subnet(&prod, Ipv4Addr::new(10, 1, 0, 0), 24, "servers");

        assert!(matches!(
            resolve_subnet(&ipam, &lab, "servers").await,
            Err(Error::SubnetNotFound(_))
        ));
        assert!(matches!(
            resolve_subnet(&ipam, "999", "servers").await,
            Err(Error::SubnetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_transport_failure_is_not_not_found() {
        let ipam = MemoryIpam::new();
        ipam.add_section("Lab");
        ipam.fail_next(Operation::ListSections, 1);

        assert!(matches!(
            resolve_section(&ipam, "Lab").await,
            Err(Error::Client(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_listing_is_an_api_error() {
        let ipam = MemoryIpam::new();
        let section = ipam.add_section("Lab");
        let subnet = ipam.add_subnet(&section, Ipv4Addr::new(10, 0, 0, 0), 24, "servers");
        ipam.insert_address(&subnet, "10.0.0.10", "web");
        ipam.reject(Operation::SearchHostname, 500, "Database error");
        ipam.reject(Operation::SearchIp, 401, "Please provide token");

        assert!(matches!(
            find_by_hostname(&ipam, "web").await,
            Err(Error::Api { code: 500, .. })
        ));
        assert!(matches!(
            find_id_by_ip(&ipam, "10.0.0.10").await,
            Err(Error::Api { code: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_find_by_hostname_counts() {
        let ipam = MemoryIpam::new();
        let section = ipam.add_section("Lab");
        let subnet = ipam.add_subnet(&section, Ipv4Addr::new(10, 0, 0, 0), 24, "servers");

        let (count, records) = find_by_hostname(&ipam, "web").await.unwrap();
        assert_eq!(count, 0);
        assert!(records.is_empty());

        ipam.insert_address(&subnet, "10.0.0.10", "web");
        ipam.insert_address(&subnet, "10.0.0.11", "web");
        let (count, records) = find_by_hostname(&ipam, "web").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_find_id_by_ip_requires_single_match() {
        let ipam = MemoryIpam::new();
        let section = ipam.add_section("Lab");
        let subnet = ipam.add_subnet(&section, Ipv4Addr::new(10, 0, 0, 0), 24, "servers");

        assert!(matches!(
            find_id_by_ip(&ipam, "10.0.0.10").await,
            Err(Error::OverAllocated { count: 0, .. })
        ));

        let id = ipam.insert_address(&subnet, "10.0.0.10", "web");
        assert_eq!(find_id_by_ip(&ipam, "10.0.0.10").await.unwrap(), id);

        ipam.insert_address(&subnet, "10.0.0.10", "web-copy");
        assert!(matches!(
            find_id_by_ip(&ipam, "10.0.0.10").await,
            Err(Error::OverAllocated { count: 2, .. })
        ));
    }
}
