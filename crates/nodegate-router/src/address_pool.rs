//! Public port allocation for `AUTO` tunnels

use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Address pool errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid port range {0:?}, expected \"first:last\" with last > first")]
    InvalidRange(String),

    #[error("Address pool exhausted")]
    Exhausted,

    #[error("No port owned by {0}")]
    OwnerNotFound(String),
}

/// Port allocation capability consumed outside the tunnel server
///
/// The node registration flow uses it to learn which public port a node was
/// handed.
pub trait PortPool: Send + Sync {
    /// Claim the lowest free port for `owner`
    fn acquire(&self, owner: &str, tunnel: &str) -> Result<u16, PoolError>;
    /// Free the lowest port held by `owner`
    fn release(&self, owner: &str) -> Result<(), PoolError>;
    /// Lowest port currently held by `owner`
    fn lookup_port(&self, owner: &str) -> Result<u16, PoolError>;
}

#[derive(Debug, Clone)]
struct Allocation {
    owner: String,
    tunnel: String,
}

/// Ports `[first, last)` with at most one owner each
///
/// Every call holds the single lock for its whole duration and scans the
/// range in ascending order, so the first free port always wins.
#[derive(Debug)]
pub struct AddressPool {
    first: u16,
    slots: Mutex<Vec<Option<Allocation>>>,
}

impl AddressPool {
    /// Pool over `[first, last)`; fails unless `last > first`
    pub fn new(first: u16, last: u16) -> Result<Self, PoolError> {
        if last <= first {
            return Err(PoolError::InvalidRange(format!("{}:{}", first, last)));
        }

        Ok(Self {
            first,
            slots: Mutex::new(vec![None; (last - first) as usize]),
        })
    }

    /// Parse a `"first:last"` range
    pub fn parse(range: &str) -> Result<Self, PoolError> {
        let invalid = || PoolError::InvalidRange(range.to_string());

        let (first, last) = range.trim().split_once(':').ok_or_else(invalid)?;
        let first: u16 = first.trim().parse().map_err(|_| invalid())?;
        let last: u16 = last.trim().parse().map_err(|_| invalid())?;

        Self::new(first, last).map_err(|_| invalid())
    }

    /// Lowest port of the range
    pub fn first(&self) -> u16 {
        self.first
    }

    /// Number of ports in the range
    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Number of ports currently assigned
    pub fn in_use(&self) -> usize {
        self.slots().iter().filter(|slot| slot.is_some()).count()
    }

    /// Claim the lowest free port for `owner`'s `tunnel`
    pub fn acquire(&self, owner: &str, tunnel: &str) -> Result<u16, PoolError> {
        let mut slots = self.slots();

        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(PoolError::Exhausted)?;

        slots[index] = Some(Allocation {
            owner: owner.to_string(),
            tunnel: tunnel.to_string(),
        });

        let port = self.port_at(index);
        debug!(owner, tunnel, port, "Acquired pool port");
        Ok(port)
    }

    /// Free the lowest port held by `owner`; unknown owners are an error
    pub fn release(&self, owner: &str) -> Result<(), PoolError> {
        let mut slots = self.slots();

        let index = slots
            .iter()
            .position(|slot| matches!(slot, Some(a) if a.owner == owner))
            .ok_or_else(|| PoolError::OwnerNotFound(owner.to_string()))?;

        slots[index] = None;
        debug!(owner, port = self.port_at(index), "Released pool port");
        Ok(())
    }

    /// Free the port `owner` holds for one specific tunnel
    pub fn release_tunnel(&self, owner: &str, tunnel: &str) -> Result<u16, PoolError> {
        let mut slots = self.slots();

        let index = slots
            .iter()
            .position(|slot| matches!(slot, Some(a) if a.owner == owner && a.tunnel == tunnel))
            .ok_or_else(|| PoolError::OwnerNotFound(format!("{}/{}", owner, tunnel)))?;

        slots[index] = None;
        let port = self.port_at(index);
        debug!(owner, tunnel, port, "Released pool port");
        Ok(port)
    }

    /// Lowest port currently held by `owner`
    pub fn lookup_port(&self, owner: &str) -> Result<u16, PoolError> {
        let slots = self.slots();

        let index = slots
            .iter()
            .position(|slot| matches!(slot, Some(a) if a.owner == owner))
            .ok_or_else(|| PoolError::OwnerNotFound(owner.to_string()))?;

        trace!(owner, port = self.port_at(index), "Looked up pool port");
        Ok(self.port_at(index))
    }

    fn port_at(&self, index: usize) -> u16 {
        self.first + index as u16
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Option<Allocation>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PortPool for AddressPool {
    fn acquire(&self, owner: &str, tunnel: &str) -> Result<u16, PoolError> {
        AddressPool::acquire(self, owner, tunnel)
    }

    fn release(&self, owner: &str) -> Result<(), PoolError> {
        AddressPool::release(self, owner)
    }

    fn lookup_port(&self, owner: &str) -> Result<u16, PoolError> {
        AddressPool::lookup_port(self, owner)
    }
}
