//! # ipamlease
//!
//! Declarative IP address allocation against a phpIPAM REST service.
//!
//! ## Features
//!
//! - Allocate the first free address of a subnet, addressed by section name
//!   and subnet description
//! - Rename in place, or reallocate when the section or subnet changes
//! - Refuse to release an address whose host still answers a ping
//! - Allocation serialized per orchestrator so concurrent callers never
//!   claim the same address
//! - Resource state persisted to a JSON file
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ipamlease::{AddressSpec, Config, Orchestrator, PhpIpamClient, Resources};
//!
//! #[tokio::main]
//! async fn main() -> ipamlease::Result<()> {
//!     let config = Config::load_or_default("ipamlease.json")?.with_env_fallback();
//!     config.validate()?;
//!
//!     let client = Arc::new(PhpIpamClient::new(&config)?);
//!     let orchestrator = Arc::new(Orchestrator::new(client, &config.client_tag));
//!     let resources = Resources::open(orchestrator, &config.state_file).await?;
//!
//!     let web = resources
//!         .apply("web", &AddressSpec::new("Customers", "servers", "web-01"))
//!         .await?;
//!     println!("{} -> {}", web.hostname, web.ip_address);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`IpamApi`] - IPAM capability surface; [`PhpIpamClient`] over HTTP,
//!   [`MemoryIpam`] in-process
//! - [`resolver`] - section, subnet and address lookups
//! - [`AllocationGuard`] - serializes the allocation path
//! - [`Orchestrator`] - create, read, update and delete of addresses
//! - [`Resources`] - named resources with persisted state

pub mod client;
pub mod config;
pub mod error;
pub mod guard;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod resource;

pub use client::{ClientError, IpamApi, PhpIpamClient};
pub use config::Config;
pub use error::{Error, Result};
pub use guard::AllocationGuard;
pub use memory::MemoryIpam;
pub use orchestrator::{AddressRecord, AddressSpec, Orchestrator};
pub use resource::{AddressResource, Resources};
