//! /30 subnet allocation for container networks.
//!
//! The pool carves a configured CIDR range into /30 networks and hands them
//! out first-in first-out. Subnets outside the range can be reserved
//! statically. On startup, allocations persisted with each container are
//! replayed through [`SubnetPool::recover`].
//!
//! ```text
//!   10.2.3.0/29
//!   ├── 10.2.3.0/30   gateway .1  container .2
//!   └── 10.2.3.4/30   gateway .5  container .6
//! ```

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::error::{SubnetError, SubnetResult};
use super::subnet::Ipv4Subnet;

/// Prefix length of every dynamically allocated subnet.
pub const SUBNET_PREFIX: u8 = 30;
/// Addresses per /30.
const SUBNET_STRIDE: u64 = 4;

#[derive(Debug, Default)]
struct PoolState {
    /// Unallocated subnets inside the range, oldest first.
    free: VecDeque<Ipv4Subnet>,
    /// Reservations outside the range.
    statics: Vec<Ipv4Subnet>,
}

/// Thread-safe /30 allocator over a fixed dynamic range.
#[derive(Debug)]
pub struct SubnetPool {
    range: Ipv4Subnet,
    capacity: usize,
    state: Mutex<PoolState>,
}

/// Every /30 whose addresses all fall inside `range`, in address order.
fn carve(range: &Ipv4Subnet) -> VecDeque<Ipv4Subnet> {
    let start = u64::from(u32::from(range.base()));
    let end = start + range.size();
    let mut out = VecDeque::new();
    let mut next = start;
    while next + SUBNET_STRIDE <= end {
        let Ok(ip) = u32::try_from(next) else { break };
        let subnet = Ipv4Subnet::new(Ipv4Addr::from(ip), SUBNET_PREFIX);
        if range.contains(&subnet) {
            out.push_back(subnet);
        }
        next += SUBNET_STRIDE;
    }
    out
}

impl SubnetPool {
    pub fn new(range: Ipv4Subnet) -> Self {
        let free = carve(&range);
        let capacity = free.len();
        info!(%range, capacity, "subnet pool initialized");
        Self {
            range,
            capacity,
            state: Mutex::new(PoolState {
                free,
                statics: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn range(&self) -> Ipv4Subnet {
        self.range
    }

    /// Number of /30s the range can ever yield. Never changes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subnets currently free for dynamic allocation.
    pub fn available(&self) -> usize {
        self.state().free.len()
    }

    /// Take the oldest free subnet.
    pub fn allocate_dynamically(&self) -> SubnetResult<Ipv4Subnet> {
        let mut state = self.state();
        let subnet = state
            .free
            .pop_front()
            .ok_or(SubnetError::InsufficientSubnets)?;
        debug!(%subnet, remaining = state.free.len(), "allocated subnet");
        Ok(subnet)
    }

    /// Reserve a subnet outside the dynamic range.
    pub fn allocate_statically(&self, subnet: Ipv4Subnet) -> SubnetResult<()> {
        let mut state = self.state();
        self.reserve_static(&mut state, subnet)?;
        debug!(%subnet, "allocated static subnet");
        Ok(())
    }

    fn reserve_static(&self, state: &mut PoolState, subnet: Ipv4Subnet) -> SubnetResult<()> {
        if self.range.overlaps(&subnet) || state.statics.iter().any(|s| s.overlaps(&subnet)) {
            return Err(SubnetError::AlreadyAllocated(subnet));
        }
        state.statics.push(subnet);
        Ok(())
    }

    /// Give a subnet back.
    ///
    /// Static reservations are forgotten; subnets from the range return to
    /// the tail of the free list.
    pub fn release(&self, subnet: Ipv4Subnet) -> SubnetResult<()> {
        let mut state = self.state();
        if let Some(pos) = state.statics.iter().position(|s| *s == subnet) {
            state.statics.swap_remove(pos);
            debug!(%subnet, "released static subnet");
            return Ok(());
        }
        if !self.is_pool_subnet(&subnet) || state.free.contains(&subnet) {
            return Err(SubnetError::ReleasedUnallocated(subnet));
        }
        state.free.push_back(subnet);
        debug!(%subnet, available = state.free.len(), "released subnet");
        Ok(())
    }

    /// Mark a persisted allocation as taken again after a restart.
    ///
    /// Outside the range this is a static reservation. Inside it the subnet
    /// is only removed from the free list and is not tracked as static.
    pub fn recover(&self, subnet: Ipv4Subnet) -> SubnetResult<()> {
        let mut state = self.state();
        if !self.range.overlaps(&subnet) {
            self.reserve_static(&mut state, subnet)?;
            debug!(%subnet, "recovered static subnet");
            return Ok(());
        }
        let pos = state
            .free
            .iter()
            .position(|s| *s == subnet)
            .ok_or(SubnetError::AlreadyAllocated(subnet))?;
        state.free.remove(pos);
        debug!(%subnet, "recovered subnet");
        Ok(())
    }

    fn is_pool_subnet(&self, subnet: &Ipv4Subnet) -> bool {
        subnet.prefix() == SUBNET_PREFIX && self.range.contains(subnet)
    }
}
