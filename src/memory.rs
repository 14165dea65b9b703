//! In-process IPAM backend.
//!
//! [`MemoryIpam`] answers the [`IpamApi`] surface from an in-memory table
//! of sections, IPv4 subnets and addresses, using the same envelope codes
//! phpIPAM does. It also supports injected call failures, status rejections,
//! a call log and a probe that records how many first-free allocations overlapped.
//!
//! First-free allocation picks an address, yields to the scheduler and only
//! then commits the record, so callers that are not serialized genuinely
//! race for the same address.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::client::{ClientError, ClientResult, IpamApi};
use crate::models::{
    Address, ApiResponse, CODE_NOT_FOUND, Gateway, Section, Subnet, SubnetCalculation,
};

/// Identifies an [`IpamApi`] call, for failure injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListSections,
    ListSubnets,
    SearchHostname,
    SearchIp,
    GetAddress,
    GetSubnet,
    GetSection,
    CreateFirstFree,
    UpdateHostname,
    Ping,
    Delete,
}

#[derive(Debug)]
struct Pool {
    subnet: Subnet,
    network: u32,
    broadcast: u32,
    gateway: u32,
}

impl Pool {
    /// Usable host addresses, lowest first, excluding the gateway.
    fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (self.network.saturating_add(1)..self.broadcast)
            .filter(|host| *host != self.gateway)
            .map(Ipv4Addr::from)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sections: Vec<Section>,
    pools: Vec<Pool>,
    addresses: BTreeMap<u64, Address>,
    next_id: u64,
    live: HashSet<String>,
    /// Remaining injected failures per operation.
    failures: HashMap<Operation, usize>,
    /// Status envelopes returned instead of serving the operation.
    rejections: HashMap<Operation, (u16, String)>,
    calls: Vec<Operation>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn pool(&self, subnet_id: &str) -> Option<&Pool> {
        self.pools.iter().find(|pool| pool.subnet.id == subnet_id)
    }

    fn address(&self, address_id: &str) -> Option<&Address> {
        address_id
            .parse::<u64>()
            .ok()
            .and_then(|key| self.addresses.get(&key))
    }

    fn first_free(&self, subnet_id: &str) -> Option<Ipv4Addr> {
        let pool = self.pool(subnet_id)?;
        let used: HashSet<&str> = self
            .addresses
            .values()
            .filter(|address| address.subnet_id == subnet_id)
            .map(|address| address.ip.as_str())
            .collect();
        pool.hosts()
            .find(|host| !used.contains(host.to_string().as_str()))
    }

    fn insert_address(&mut self, subnet_id: &str, ip: &str, hostname: &str, owner: &str) -> String {
        let key = self.allocate_id();
        let id = key.to_string();
        self.addresses.insert(
            key,
            Address {
                id: id.clone(),
                subnet_id: subnet_id.to_string(),
                ip: ip.to_string(),
                hostname: hostname.to_string(),
                description: String::new(),
                owner: owner.to_string(),
            },
        );
        id
    }
}

/// In-memory implementation of [`IpamApi`].
#[derive(Debug, Default)]
pub struct MemoryIpam {
    state: Mutex<MemoryState>,
    allocations_in_flight: AtomicUsize,
    max_allocations_in_flight: AtomicUsize,
}

impl MemoryIpam {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logs the call and consumes an injected failure, if any. A rejected
    /// operation yields the envelope to answer with.
    fn enter<T>(&self, operation: Operation) -> ClientResult<Option<ApiResponse<T>>> {
        let mut state = self.state();
        state.calls.push(operation);
        if let Some(remaining) = state.failures.get_mut(&operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ClientError::Backend(format!(
                "injected {:?} failure",
                operation
            )));
        }
        Ok(state
            .rejections
            .get(&operation)
            .map(|(code, message)| ApiResponse::failure(*code, message.clone())))
    }

    pub fn add_section(&self, name: &str) -> String {
        let mut state = self.state();
        let id = state.allocate_id().to_string();
        state.sections.push(Section {
            id: id.clone(),
            name: name.to_string(),
            description: String::new(),
        });
        id
    }

    /// Adds an IPv4 subnet. The first host address becomes the gateway.
    pub fn add_subnet(
        &self,
        section_id: &str,
        network: Ipv4Addr,
        prefix: u8,
        description: &str,
    ) -> String {
        let prefix = prefix.min(32);
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        let network = u32::from(network) & mask;
        let broadcast = network | !mask;
        let gateway = network.saturating_add(1);

        let mut state = self.state();
        let id = state.allocate_id().to_string();
        let subnet = Subnet {
            id: id.clone(),
            subnet: Ipv4Addr::from(network).to_string(),
            mask: prefix.to_string(),
            section_id: section_id.to_string(),
            description: description.to_string(),
            gateway: Some(Gateway {
                ip_addr: Ipv4Addr::from(gateway).to_string(),
                id: None,
            }),
            calculation: Some(SubnetCalculation {
                broadcast: Ipv4Addr::from(broadcast).to_string(),
                bitmask: prefix.to_string(),
            }),
        };
        state.pools.push(Pool {
            subnet,
            network,
            broadcast,
            gateway,
        });
        id
    }

    /// Inserts an address record directly, bypassing allocation.
    pub fn insert_address(&self, subnet_id: &str, ip: &str, hostname: &str) -> String {
        self.state().insert_address(subnet_id, ip, hostname, "")
    }

    pub fn remove_section(&self, section_id: &str) {
        self.state().sections.retain(|section| section.id != section_id);
    }

    pub fn remove_subnet(&self, subnet_id: &str) {
        self.state().pools.retain(|pool| pool.subnet.id != subnet_id);
    }

    /// Marks an address as answering (or not) the reachability probe.
    pub fn set_live(&self, address_id: &str, live: bool) {
        let mut state = self.state();
        if live {
            state.live.insert(address_id.to_string());
        } else {
            state.live.remove(address_id);
        }
    }

    /// Makes the next `times` calls of `operation` fail to complete.
    pub fn fail_next(&self, operation: Operation, times: usize) {
        self.state().failures.insert(operation, times);
    }

    /// Makes every call of `operation` fail to complete.
    pub fn fail_always(&self, operation: Operation) {
        self.fail_next(operation, usize::MAX);
    }

    /// Answers every call of `operation` with a `code` envelope until
    /// [`MemoryIpam::recover`] is called.
    pub fn reject(&self, operation: Operation, code: u16, message: &str) {
        self.state()
            .rejections
            .insert(operation, (code, message.to_string()));
    }

    /// Clears injected failures and rejections for `operation`.
    pub fn recover(&self, operation: Operation) {
        let mut state = self.state();
        state.failures.remove(&operation);
        state.rejections.remove(&operation);
    }

    pub fn get(&self, address_id: &str) -> Option<Address> {
        self.state().address(address_id).cloned()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.state().addresses.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Highest number of first-free allocations observed running at once.
    pub fn max_concurrent_allocations(&self) -> usize {
        self.max_allocations_in_flight.load(Ordering::SeqCst)
    }
}

fn not_found<T>(what: &str) -> ApiResponse<T> {
    ApiResponse::failure(CODE_NOT_FOUND, format!("{} not found", what))
}

#[async_trait]
impl IpamApi for MemoryIpam {
    async fn list_sections(&self) -> ClientResult<ApiResponse<Vec<Section>>> {
        if let Some(rejected) = self.enter(Operation::ListSections)? {
            return Ok(rejected);
        }
        Ok(ApiResponse::ok(self.state().sections.clone()))
    }

    async fn list_section_subnets(
        &self,
        section_id: &str,
    ) -> ClientResult<ApiResponse<Vec<Subnet>>> {
        if let Some(rejected) = self.enter(Operation::ListSubnets)? {
            return Ok(rejected);
        }
        let state = self.state();
        if !state.sections.iter().any(|section| section.id == section_id) {
            return Ok(not_found("Section"));
        }
        let subnets: Vec<Subnet> = state
            .pools
            .iter()
            .filter(|pool| pool.subnet.section_id == section_id)
            .map(|pool| pool.subnet.clone())
            .collect();
        if subnets.is_empty() {
            return Ok(not_found("Subnets"));
        }
        Ok(ApiResponse::ok(subnets))
    }

    async fn search_hostname(&self, hostname: &str) -> ClientResult<ApiResponse<Vec<Address>>> {
        if let Some(rejected) = self.enter(Operation::SearchHostname)? {
            return Ok(rejected);
        }
        let matches: Vec<Address> = self
            .state()
            .addresses
            .values()
            .filter(|address| address.hostname == hostname)
            .cloned()
            .collect();
        if matches.is_empty() {
            return Ok(not_found("Address"));
        }
        Ok(ApiResponse::ok(matches))
    }

    async fn search_ip(&self, ip: &str) -> ClientResult<ApiResponse<Vec<Address>>> {
        if let Some(rejected) = self.enter(Operation::SearchIp)? {
            return Ok(rejected);
        }
        let matches: Vec<Address> = self
            .state()
            .addresses
            .values()
            .filter(|address| address.ip == ip)
            .cloned()
            .collect();
        if matches.is_empty() {
            return Ok(not_found("Address"));
        }
        Ok(ApiResponse::ok(matches))
    }

    async fn get_address(&self, address_id: &str) -> ClientResult<ApiResponse<Address>> {
        if let Some(rejected) = self.enter(Operation::GetAddress)? {
            return Ok(rejected);
        }
        Ok(match self.state().address(address_id) {
            Some(address) => ApiResponse::ok(address.clone()),
            None => not_found("Address"),
        })
    }

    async fn get_subnet(&self, subnet_id: &str) -> ClientResult<ApiResponse<Subnet>> {
        if let Some(rejected) = self.enter(Operation::GetSubnet)? {
            return Ok(rejected);
        }
        Ok(match self.state().pool(subnet_id) {
            Some(pool) => ApiResponse::ok(pool.subnet.clone()),
            None => not_found("Subnet"),
        })
    }

    async fn get_section(&self, section_id: &str) -> ClientResult<ApiResponse<Section>> {
        if let Some(rejected) = self.enter(Operation::GetSection)? {
            return Ok(rejected);
        }
        let state = self.state();
        Ok(
            match state.sections.iter().find(|section| section.id == section_id) {
                Some(section) => ApiResponse::ok(section.clone()),
                None => not_found("Section"),
            },
        )
    }

    async fn create_first_free(
        &self,
        subnet_id: &str,
        hostname: &str,
        owner: &str,
    ) -> ClientResult<ApiResponse<String>> {
        if let Some(rejected) = self.enter(Operation::CreateFirstFree)? {
            return Ok(rejected);
        }

        let in_flight = self.allocations_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_allocations_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let (exists, candidate) = {
            let state = self.state();
            (state.pool(subnet_id).is_some(), state.first_free(subnet_id))
        };

        tokio::task::yield_now().await;

        let response = match (exists, candidate) {
            (false, _) => not_found("Subnet"),
            (true, None) => ApiResponse::failure(CODE_NOT_FOUND, "No free addresses found"),
            (true, Some(ip)) => {
                let ip = ip.to_string();
                let id = self.state().insert_address(subnet_id, &ip, hostname, owner);
                ApiResponse::created(id, ip, "Address created")
            }
        };

        self.allocations_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response)
    }

    async fn update_hostname(
        &self,
        address_id: &str,
        hostname: &str,
    ) -> ClientResult<ApiResponse<Value>> {
        if let Some(rejected) = self.enter(Operation::UpdateHostname)? {
            return Ok(rejected);
        }
        let mut state = self.state();
        let key = address_id.parse::<u64>().ok();
        Ok(match key.and_then(|key| state.addresses.get_mut(&key)) {
            Some(address) => {
                address.hostname = hostname.to_string();
                ApiResponse::ok(json!({ "message": "Address updated" }))
            }
            None => not_found("Address"),
        })
    }

    async fn ping_address(&self, address_id: &str) -> ClientResult<ApiResponse<Value>> {
        if let Some(rejected) = self.enter(Operation::Ping)? {
            return Ok(rejected);
        }
        let state = self.state();
        if state.address(address_id).is_none() {
            return Ok(not_found("Address"));
        }
        Ok(if state.live.contains(address_id) {
            ApiResponse::ok(json!({ "scan_type": "ping", "result": 0 }))
        } else {
            ApiResponse::failure(CODE_NOT_FOUND, "Address offline")
        })
    }

    async fn delete_address(&self, address_id: &str) -> ClientResult<ApiResponse<Value>> {
        if let Some(rejected) = self.enter(Operation::Delete)? {
            return Ok(rejected);
        }
        let mut state = self.state();
        let removed = address_id
            .parse::<u64>()
            .ok()
            .and_then(|key| state.addresses.remove(&key));
        Ok(match removed {
            Some(_) => {
                state.live.remove(address_id);
                ApiResponse::ok(json!({ "message": "Address deleted" }))
            }
            None => not_found("Address"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_free_skips_gateway_and_used() {
        let ipam = MemoryIpam::new();
        let section = ipam.add_section("Customers");
        let subnet = ipam.add_subnet(&section, Ipv4Addr::new(10, 0, 0, 0), 29, "tiny");
        ipam.insert_address(&subnet, "10.0.0.2", "taken");

        let response = ipam.create_first_free(&subnet, "web", "tests").await.unwrap();
        assert_eq!(response.data.as_deref(), Some("10.0.0.3"));

        let subnet_info = ipam.get_subnet(&subnet).await.unwrap().data.unwrap();
        assert_eq!(subnet_info.gateway_ip(), "10.0.0.1");
        assert_eq!(subnet_info.broadcast(), "10.0.0.7");
        assert_eq!(subnet_info.bitmask(), "29");
    }

    #[tokio::test]
    async fn test_exhausted_subnet() {
        let ipam = MemoryIpam::new();
        let section = ipam.add_section("Customers");
        let subnet = ipam.add_subnet(&section, Ipv4Addr::new(10, 0, 0, 0), 30, "p2p");

        let first = ipam.create_first_free(&subnet, "a", "tests").await.unwrap();
        assert!(first.is_success());
        let second = ipam.create_first_free(&subnet, "b", "tests").await.unwrap();
        assert!(!second.is_success());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let ipam = MemoryIpam::new();
        ipam.fail_next(Operation::ListSections, 1);

        assert!(ipam.list_sections().await.is_err());
        assert!(ipam.list_sections().await.is_ok());
        assert_eq!(
            ipam.calls(),
            vec![Operation::ListSections, Operation::ListSections]
        );
    }

    #[tokio::test]
    async fn test_recover_clears_failures_and_rejections() {
        let ipam = MemoryIpam::new();
        ipam.add_section("Customers");
        ipam.fail_always(Operation::ListSections);
        ipam.reject(Operation::SearchHostname, 500, "Database error");

        assert!(ipam.list_sections().await.is_err());
        assert!(ipam.list_sections().await.is_err());
        let rejected = ipam.search_hostname("web").await.unwrap();
        assert_eq!(rejected.code, 500);
        assert_eq!(rejected.message.as_deref(), Some("Database error"));

        ipam.recover(Operation::ListSections);
        ipam.recover(Operation::SearchHostname);
        assert_eq!(ipam.list_sections().await.unwrap().data.unwrap().len(), 1);
        assert_eq!(ipam.search_hostname("web").await.unwrap().code, 404);
    }

    #[tokio::test]
    async fn test_ping_reports_liveness() {
        let ipam = MemoryIpam::new();
        let section = ipam.add_section("Customers");
        let subnet = ipam.add_subnet(&section, Ipv4Addr::new(10, 0, 0, 0), 24, "lan");
        let id = ipam.insert_address(&subnet, "10.0.0.9", "db");

        assert!(!ipam.ping_address(&id).await.unwrap().is_ok());
        ipam.set_live(&id, true);
        assert!(ipam.ping_address(&id).await.unwrap().is_ok());
    }
}
