//! Overlay address allocation
//!
//! Addresses are handed out from a single forward-only counter of host
//! offsets within the configured IPv4 subnet. Offset 1 belongs to the
//! server, so the first peer receives offset 2. Offsets released by peer
//! deletion are never reused: once the counter passes the last host offset
//! every further allocation fails with `AllocationExhausted`.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Host offset reserved for the server's own tunnel address
pub const SERVER_OFFSET: u32 = 1;

/// First host offset handed to a peer
pub const FIRST_PEER_OFFSET: u32 = SERVER_OFFSET + 1;

/// An IPv4 overlay subnet in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet, masking off any host bits in `network`
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if !(8..=30).contains(&prefix_len) {
            return Err(ProvisionError::Config(format!(
                "Subnet prefix /{} is out of range (8-30)",
                prefix_len
            )));
        }

        let mask = !0u32 << (32 - prefix_len);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(network) & mask),
            prefix_len,
        })
    }

    /// Network address
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length in bits
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of addresses in the subnet, network and broadcast included
    pub fn capacity(&self) -> u32 {
        1u32 << (32 - self.prefix_len)
    }

    /// Highest usable host offset (254 for a /24)
    pub fn max_host_offset(&self) -> u32 {
        self.capacity() - 2
    }

    /// Address at `offset`, if it is a usable host offset
    pub fn address_at(&self, offset: u32) -> Option<Ipv4Addr> {
        if offset == 0 || offset > self.max_host_offset() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + offset))
    }

    /// Host offset of `addr` within this subnet
    pub fn offset_of(&self, addr: Ipv4Addr) -> Option<u32> {
        if !self.contains(addr) {
            return None;
        }
        Some(u32::from(addr) - u32::from(self.network))
    }

    /// Whether `addr` lies inside the subnet
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = !0u32 << (32 - self.prefix_len);
        u32::from(addr) & mask == u32::from(self.network)
    }
}

impl FromStr for Subnet {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, prefix) = s.trim().split_once('/').ok_or_else(|| {
            ProvisionError::Config(format!(
                "Invalid subnet '{}' (expected CIDR notation like 10.8.0.0/24)",
                s
            ))
        })?;

        let network: Ipv4Addr = ip
            .parse()
            .map_err(|e| ProvisionError::Config(format!("Invalid subnet address '{}': {}", ip, e)))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|e| ProvisionError::Config(format!("Invalid subnet prefix '{}': {}", prefix, e)))?;

        Self::new(network, prefix_len)
    }
}

impl TryFrom<String> for Subnet {
    type Error = ProvisionError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Forward-only address allocator over a subnet
///
/// The allocator owns no state of its own: the counter lives in the
/// server identity record so it is committed together with the peer that
/// consumes the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressAllocator {
    subnet: Subnet,
}

impl AddressAllocator {
    /// Create an allocator for `subnet`
    pub fn new(subnet: Subnet) -> Self {
        Self { subnet }
    }

    /// The subnet addresses are drawn from
    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// The server's own tunnel address
    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + SERVER_OFFSET)
    }

    /// Advance `last_assigned` and return the address it now points at
    ///
    /// On exhaustion the counter is left untouched.
    pub fn allocate(&self, last_assigned: &mut u32) -> Result<Ipv4Addr> {
        let next = (*last_assigned).max(SERVER_OFFSET) + 1;
        let max_offset = self.subnet.max_host_offset();

        let addr = self
            .subnet
            .address_at(next)
            .ok_or(ProvisionError::AllocationExhausted { max_offset })?;

        *last_assigned = next;
        Ok(addr)
    }

    /// How many more allocations will succeed from `last_assigned`
    pub fn remaining(&self, last_assigned: u32) -> u32 {
        self.subnet
            .max_host_offset()
            .saturating_sub(last_assigned.max(SERVER_OFFSET))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slash24() -> Subnet {
        "10.8.0.0/24".parse().unwrap()
    }

    #[test]
    fn test_parse_subnet() {
        let subnet = slash24();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(subnet.prefix_len(), 24);
        assert_eq!(subnet.capacity(), 256);
        assert_eq!(subnet.max_host_offset(), 254);
        assert_eq!(subnet.to_string(), "10.8.0.0/24");
    }

    #[test]
    fn test_parse_masks_host_bits() {
        let subnet: Subnet = "10.8.0.77/24".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 8, 0, 0));
    }

    #[test]
    fn test_parse_invalid_subnets() {
        assert!("10.8.0.0".parse::<Subnet>().is_err());
        assert!("10.8.0.0/31".parse::<Subnet>().is_err());
        assert!("10.8.0.0/4".parse::<Subnet>().is_err());
        assert!("fe80::/64".parse::<Subnet>().is_err());
        assert!("10.8.0.0/abc".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_offsets() {
        let subnet = slash24();
        assert_eq!(subnet.address_at(2), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(subnet.address_at(254), Some(Ipv4Addr::new(10, 8, 0, 254)));
        assert_eq!(subnet.address_at(255), None);
        assert_eq!(subnet.address_at(0), None);
        assert_eq!(subnet.offset_of(Ipv4Addr::new(10, 8, 0, 9)), Some(9));
        assert_eq!(subnet.offset_of(Ipv4Addr::new(10, 9, 0, 9)), None);
    }

    #[test]
    fn test_first_allocation_skips_server() {
        let allocator = AddressAllocator::new(slash24());
        let mut counter = SERVER_OFFSET;

        assert_eq!(allocator.server_address(), Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(allocator.allocate(&mut counter).unwrap(), Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(counter, 2);
        assert_eq!(allocator.allocate(&mut counter).unwrap(), Ipv4Addr::new(10, 8, 0, 3));
    }

    #[test]
    fn test_zero_counter_treated_as_server_offset() {
        let allocator = AddressAllocator::new(slash24());
        let mut counter = 0;
        assert_eq!(allocator.allocate(&mut counter).unwrap(), Ipv4Addr::new(10, 8, 0, 2));
    }

    #[test]
    fn test_exhaustion_does_not_advance_counter() {
        let allocator = AddressAllocator::new(slash24());
        let mut counter = SERVER_OFFSET;

        for _ in 0..253 {
            allocator.allocate(&mut counter).unwrap();
        }
        assert_eq!(counter, 254);
        assert_eq!(allocator.remaining(counter), 0);

        let err = allocator.allocate(&mut counter).unwrap_err();
        assert!(matches!(err, ProvisionError::AllocationExhausted { max_offset: 254 }));
        assert_eq!(counter, 254);

        // Still exhausted on retry
        assert!(allocator.allocate(&mut counter).is_err());
        assert_eq!(counter, 254);
    }

    #[test]
    fn test_subnet_serde_as_string() {
        let json = serde_json::to_string(&slash24()).unwrap();
        assert_eq!(json, "\"10.8.0.0/24\"");
        let parsed: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, slash24());
    }

    proptest! {
        #[test]
        fn prop_allocations_strictly_increase(prefix in 24u8..=30, extra in 0u32..8) {
            let subnet = Subnet::new(Ipv4Addr::new(10, 20, 0, 0), prefix).unwrap();
            let allocator = AddressAllocator::new(subnet);
            let mut counter = SERVER_OFFSET;
            let mut previous = u32::from(allocator.server_address());
            let mut successes = 0u32;

            for _ in 0..(subnet.max_host_offset() + extra) {
                match allocator.allocate(&mut counter) {
                    Ok(addr) => {
                        let offset = subnet.offset_of(addr).unwrap();
                        prop_assert!(offset >= FIRST_PEER_OFFSET);
                        prop_assert!(offset <= subnet.max_host_offset());
                        prop_assert!(u32::from(addr) > previous);
                        previous = u32::from(addr);
                        successes += 1;
                    }
                    Err(_) => prop_assert_eq!(counter, subnet.max_host_offset()),
                }
            }

            prop_assert_eq!(successes, subnet.max_host_offset() - SERVER_OFFSET);
        }
    }
}
