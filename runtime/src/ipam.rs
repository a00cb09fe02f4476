//! IP address management.
//!
//! Tracks which addresses of each subnet are handed out to containers.
//! State is in-process only: one read/write lock per manager instance.
//! Independent runtime processes sharing a subnet are not coordinated here.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use a3s_ctr_core::error::{CtrError, Result};
use a3s_ctr_core::network::Subnet;
use parking_lot::RwLock;

/// Address allocation capability.
pub trait AddressAllocator: Send + Sync {
    /// Hand out the lowest free address (scan starts at network+2).
    fn allocate(&self, subnet: &Subnet) -> Result<Ipv4Addr>;

    /// Return an address to the pool; it is reusable immediately.
    fn release(&self, subnet: &Subnet, ip: Ipv4Addr) -> Result<()>;

    /// Mark a known address as taken (used when re-attaching to existing
    /// containers).
    fn reserve(&self, subnet: &Subnet, ip: Ipv4Addr) -> Result<()>;

    fn is_allocated(&self, subnet: &Subnet, ip: Ipv4Addr) -> bool;

    /// Allocated addresses in ascending order.
    fn allocated(&self, subnet: &Subnet) -> Vec<Ipv4Addr>;

    /// `(total - 3) - allocated`, floored at zero.
    fn available_count(&self, subnet: &Subnet) -> u64;
}

/// In-memory allocator: subnet -> set of allocated addresses.
#[derive(Debug, Default)]
pub struct Ipam {
    allocated: RwLock<HashMap<Subnet, HashSet<Ipv4Addr>>>,
}

impl Ipam {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressAllocator for Ipam {
    fn allocate(&self, subnet: &Subnet) -> Result<Ipv4Addr> {
        let mut table = self.allocated.write();
        let used = table.entry(*subnet).or_default();

        let ip = subnet
            .hosts()
            .find(|ip| !used.contains(ip))
            .ok_or_else(|| {
                CtrError::NetworkError(format!("no available IP addresses in subnet {}", subnet))
            })?;
        used.insert(ip);

        tracing::debug!(subnet = %subnet, ip = %ip, "Allocated address");
        Ok(ip)
    }

    fn release(&self, subnet: &Subnet, ip: Ipv4Addr) -> Result<()> {
        let mut table = self.allocated.write();
        if let Some(used) = table.get_mut(subnet) {
            if used.remove(&ip) {
                tracing::debug!(subnet = %subnet, ip = %ip, "Released address");
            }
        }
        Ok(())
    }

    fn reserve(&self, subnet: &Subnet, ip: Ipv4Addr) -> Result<()> {
        if !subnet.contains(ip) || subnet.is_reserved(ip) {
            return Err(CtrError::Validation(format!(
                "address {} is not assignable in subnet {}",
                ip, subnet
            )));
        }
        let mut table = self.allocated.write();
        if !table.entry(*subnet).or_default().insert(ip) {
            return Err(CtrError::Conflict(format!(
                "address {} already allocated in subnet {}",
                ip, subnet
            )));
        }
        Ok(())
    }

    fn is_allocated(&self, subnet: &Subnet, ip: Ipv4Addr) -> bool {
        self.allocated
            .read()
            .get(subnet)
            .map(|used| used.contains(&ip))
            .unwrap_or(false)
    }

    fn allocated(&self, subnet: &Subnet) -> Vec<Ipv4Addr> {
        let mut ips: Vec<Ipv4Addr> = self
            .allocated
            .read()
            .get(subnet)
            .map(|used| used.iter().copied().collect())
            .unwrap_or_default();
        ips.sort();
        ips
    }

    fn available_count(&self, subnet: &Subnet) -> u64 {
        let used = self
            .allocated
            .read()
            .get(subnet)
            .map(|used| used.len() as u64)
            .unwrap_or(0);
        subnet.capacity().saturating_sub(used)
    }
}

/// Allocator for hosts without container networking.
#[derive(Debug, Default)]
pub struct UnsupportedIpam;

impl UnsupportedIpam {
    fn error() -> CtrError {
        CtrError::unsupported(
            "IP address management",
            "IP address management is only supported on Linux",
        )
    }
}

impl AddressAllocator for UnsupportedIpam {
    fn allocate(&self, _subnet: &Subnet) -> Result<Ipv4Addr> {
        Err(Self::error())
    }

    fn release(&self, _subnet: &Subnet, _ip: Ipv4Addr) -> Result<()> {
        Err(Self::error())
    }

    fn reserve(&self, _subnet: &Subnet, _ip: Ipv4Addr) -> Result<()> {
        Err(Self::error())
    }

    fn is_allocated(&self, _subnet: &Subnet, _ip: Ipv4Addr) -> bool {
        false
    }

    fn allocated(&self, _subnet: &Subnet) -> Vec<Ipv4Addr> {
        Vec::new()
    }

    fn available_count(&self, _subnet: &Subnet) -> u64 {
        0
    }
}

/// Pick the allocator for this host: the full one when the kernel exposes
/// network namespaces, the degraded one otherwise.
pub fn select_allocator() -> Box<dyn AddressAllocator> {
    if Path::new("/proc/self/ns/net").exists() {
        Box::new(Ipam::new())
    } else {
        tracing::debug!("Network namespaces unavailable, address allocation disabled");
        Box::new(UnsupportedIpam)
    }
}
