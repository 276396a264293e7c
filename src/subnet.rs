//! Subnet state and the address-allocation state machine.
//!
//! A [`Subnet`] owns one contiguous IPv4 network: its dynamic range, the
//! bitset tracking which range addresses are held, dynamic leases and static
//! bindings indexed by MAC, and the option templates rendered into replies.
//!
//! # Thread safety
//!
//! Identity fields (name, CIDR, range, lease times, option templates) are
//! immutable after construction. Everything mutable lives behind one
//! [`RwLock`]; packet fast paths take read locks, allocation and
//! administrative mutations take the write lock. Persistence happens outside
//! the lock, through the repository.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::bitset::BitSet;
use crate::error::{Error, Result};
use crate::options::{OptionCode, OptionTemplate};
use crate::packet::DhcpPacket;

const DEFAULT_ACTIVE_LEASE_SECONDS: i64 = 30;
const DEFAULT_RESERVED_LEASE_SECONDS: i64 = 2 * 60 * 60;

pub(crate) fn ip_add(ip: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(offset))
}

pub(crate) fn ip_distance(start: Ipv4Addr, ip: Ipv4Addr) -> u32 {
    u32::from(ip).wrapping_sub(u32::from(start))
}

/// A dynamic assignment of an address to a MAC.
///
/// `expire_time` stays null until the client's REQUEST commits the lease;
/// an offered-but-uncommitted lease is reclaimable under pool pressure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub valid: bool,
    #[serde(rename = "expire_time")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now > at)
    }
}

/// A static reservation of an address for a MAC. Never expires and takes
/// precedence over any dynamic lease for the same MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub ip: Ipv4Addr,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_server: Option<Ipv4Addr>,
}

/// Wire/persistence shape of a subnet, shared by the snapshot file and the
/// management payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSubnet {
    pub name: String,
    pub subnet: Ipv4Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_server: Option<Ipv4Addr>,
    pub active_start: Ipv4Addr,
    pub active_end: Ipv4Addr,
    pub active_lease_time: i64,
    pub reserved_lease_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leases: Vec<Lease>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionTemplate>,
}

#[derive(Debug, Clone)]
struct SubnetState {
    active_bits: BitSet,
    leases: HashMap<String, Lease>,
    bindings: HashMap<String, Binding>,
}

#[derive(Debug)]
pub struct Subnet {
    name: String,
    tenant_id: Option<String>,
    subnet: Ipv4Network,
    next_server: Option<Ipv4Addr>,
    active_start: Ipv4Addr,
    active_end: Ipv4Addr,
    active_lease_time: TimeDelta,
    reserved_lease_time: TimeDelta,
    options: Vec<OptionTemplate>,
    state: RwLock<SubnetState>,
}

impl Subnet {
    /// Builds a subnet from its wire shape, validating the range and
    /// reconstructing the address bitset from leases and bindings.
    pub fn from_api(api: ApiSubnet) -> Result<Self> {
        if !api.subnet.contains(api.active_start) {
            return Err(Error::InvalidSubnet(format!(
                "active_start {} not in {}",
                api.active_start, api.subnet
            )));
        }
        if !api.subnet.contains(api.active_end) {
            return Err(Error::InvalidSubnet(format!(
                "active_end {} not in {}",
                api.active_end, api.subnet
            )));
        }
        if u32::from(api.active_start) > u32::from(api.active_end) {
            return Err(Error::InvalidSubnet(format!(
                "active range {}-{} is inverted",
                api.active_start, api.active_end
            )));
        }

        let active_lease_time = if api.active_lease_time == 0 {
            TimeDelta::seconds(DEFAULT_ACTIVE_LEASE_SECONDS)
        } else {
            TimeDelta::seconds(api.active_lease_time)
        };
        let reserved_lease_time = if api.reserved_lease_time == 0 {
            TimeDelta::seconds(DEFAULT_RESERVED_LEASE_SECONDS)
        } else {
            TimeDelta::seconds(api.reserved_lease_time)
        };

        let range_size = ip_distance(api.active_start, api.active_end) as usize + 1;
        let mut state = SubnetState {
            active_bits: BitSet::new(range_size),
            leases: HashMap::new(),
            bindings: HashMap::new(),
        };

        for mut lease in api.leases {
            lease.mac = lease.mac.to_lowercase();
            if !api.subnet.contains(lease.ip) {
                return Err(Error::InvalidSubnet(format!(
                    "lease {} not in {}",
                    lease.ip, api.subnet
                )));
            }
            if in_range(api.active_start, api.active_end, lease.ip) {
                state
                    .active_bits
                    .set(ip_distance(api.active_start, lease.ip) as usize);
            }
            state.leases.insert(lease.mac.clone(), lease);
        }

        for mut binding in api.bindings {
            binding.mac = binding.mac.to_lowercase();
            if !api.subnet.contains(binding.ip) {
                return Err(Error::InvalidSubnet(format!(
                    "binding {} not in {}",
                    binding.ip, api.subnet
                )));
            }
            if in_range(api.active_start, api.active_end, binding.ip) {
                state
                    .active_bits
                    .set(ip_distance(api.active_start, binding.ip) as usize);
            }
            state.bindings.insert(binding.mac.clone(), binding);
        }

        let mut options = api.options;
        let mask_code = OptionCode::SubnetMask as u8;
        if !options.iter().any(|option| option.code == mask_code) {
            options.push(OptionTemplate::new(mask_code, api.subnet.mask().to_string()));
        }
        let broadcast_code = OptionCode::BroadcastAddress as u8;
        if !options.iter().any(|option| option.code == broadcast_code) {
            options.push(OptionTemplate::new(
                broadcast_code,
                api.subnet.broadcast().to_string(),
            ));
        }

        Ok(Self {
            name: api.name,
            tenant_id: api.tenant_id,
            subnet: api.subnet,
            next_server: api.next_server,
            active_start: api.active_start,
            active_end: api.active_end,
            active_lease_time,
            reserved_lease_time,
            options,
            state: RwLock::new(state),
        })
    }

    pub async fn to_api(&self) -> ApiSubnet {
        let state = self.state.read().await;
        let mut leases: Vec<Lease> = state.leases.values().cloned().collect();
        leases.sort_by(|a, b| a.mac.cmp(&b.mac));
        let mut bindings: Vec<Binding> = state.bindings.values().cloned().collect();
        bindings.sort_by(|a, b| a.mac.cmp(&b.mac));

        ApiSubnet {
            name: self.name.clone(),
            subnet: self.subnet,
            tenant_id: self.tenant_id.clone(),
            next_server: self.next_server,
            active_start: self.active_start,
            active_end: self.active_end,
            active_lease_time: self.active_lease_time.num_seconds(),
            reserved_lease_time: self.reserved_lease_time.num_seconds(),
            leases,
            bindings,
            options: self.options.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn cidr(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn next_server(&self) -> Option<Ipv4Addr> {
        self.next_server
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.subnet.contains(ip)
    }

    fn in_active_range(&self, ip: Ipv4Addr) -> bool {
        in_range(self.active_start, self.active_end, ip)
    }

    /// Lease duration policy: reservations hold their address far longer
    /// than dynamic clients.
    pub fn lease_duration(&self, binding: Option<&Binding>) -> TimeDelta {
        if binding.is_some() {
            self.reserved_lease_time
        } else {
            self.active_lease_time
        }
    }

    /// Current lease and binding for a MAC, read-only.
    pub async fn find_info(&self, mac: &str) -> (Option<Lease>, Option<Binding>) {
        let state = self.state.read().await;
        (state.leases.get(mac).cloned(), state.bindings.get(mac).cloned())
    }

    pub async fn has_binding_for(&self, mac: &str) -> bool {
        self.state.read().await.bindings.contains_key(mac)
    }

    /// True when the range address is currently held by a lease or binding.
    pub async fn address_held(&self, ip: Ipv4Addr) -> bool {
        if !self.in_active_range(ip) {
            return false;
        }
        let state = self.state.read().await;
        state.active_bits.test(ip_distance(self.active_start, ip) as usize)
    }

    pub async fn lease_count(&self) -> usize {
        self.state.read().await.leases.len()
    }

    /// The allocation state machine, executed per DHCP exchange.
    ///
    /// Returns the lease and binding for the MAC plus a flag telling the
    /// caller the snapshot must be persisted. The client's requested address
    /// is never granted on its own authority; it is only ever confirmed when
    /// it already matches this MAC's binding or lease.
    pub async fn find_or_allocate(
        &self,
        mac: &str,
        requested: Option<Ipv4Addr>,
    ) -> (Option<Lease>, Option<Binding>, bool) {
        // Fast path: a valid lease already exists.
        {
            let state = self.state.read().await;
            let binding = state.bindings.get(mac);
            match (state.leases.get(mac), binding) {
                (Some(lease), Some(binding)) if lease.ip == binding.ip => {
                    return (Some(lease.clone()), Some(binding.clone()), false);
                }
                (Some(_), Some(_)) => {} // stale lease, resolved below
                (Some(lease), None) => {
                    return (Some(lease.clone()), None, false);
                }
                (None, _) => {}
            }
        }

        // Slow path: re-read under the write lock, something may have
        // sneaked in between the locks.
        let mut state = self.state.write().await;
        let binding = state.bindings.get(mac).cloned();
        let existing = state.leases.get(mac).cloned();

        if let (Some(lease), Some(binding)) = (&existing, &binding)
            && lease.ip == binding.ip
        {
            return (Some(lease.clone()), Some(binding.clone()), false);
        }

        let target = if let Some(binding) = &binding {
            binding.ip
        } else {
            match self.get_free_ip(&mut state) {
                (Some(ip), _) => ip,
                (None, reclaimed) => return (None, None, reclaimed),
            }
        };

        // Replacing a stale lease releases its old address.
        if let Some(old) = &existing
            && old.ip != target
            && self.in_active_range(old.ip)
        {
            state
                .active_bits
                .clear(ip_distance(self.active_start, old.ip) as usize);
        }

        if let Some(suggestion) = requested
            && suggestion != target
        {
            debug!(%suggestion, granted = %target, mac, "Ignoring requested address");
        }

        let lease = Lease {
            ip: target,
            mac: mac.to_string(),
            valid: true,
            expires_at: None,
        };
        state.leases.insert(mac.to_string(), lease.clone());

        (Some(lease), binding, true)
    }

    /// Lowest clear bit wins; on a full set, expired leases are swept and
    /// the scan retried. The second return says a sweep freed something, so
    /// the caller owes a persist even when allocation still failed.
    fn get_free_ip(&self, state: &mut SubnetState) -> (Option<Ipv4Addr>, bool) {
        if let Some(bit) = state.active_bits.first_clear() {
            state.active_bits.set(bit);
            return (Some(ip_add(self.active_start, bit as u32)), false);
        }

        let now = Utc::now();
        let expired: Vec<String> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired(now))
            .map(|(mac, _)| mac.clone())
            .collect();
        let reclaimed = !expired.is_empty();

        for mac in expired {
            if let Some(lease) = state.leases.remove(&mac)
                && self.in_active_range(lease.ip)
            {
                state
                    .active_bits
                    .clear(ip_distance(self.active_start, lease.ip) as usize);
            }
        }

        if let Some(bit) = state.active_bits.first_clear() {
            state.active_bits.set(bit);
            return (Some(ip_add(self.active_start, bit as u32)), reclaimed);
        }

        (None, reclaimed)
    }

    /// Commits a lease for `duration` from now. Returns the updated lease,
    /// or None when the MAC holds no lease.
    pub async fn update_lease_time(&self, mac: &str, duration: TimeDelta) -> Option<Lease> {
        let mut state = self.state.write().await;
        let lease = state.leases.get_mut(mac)?;
        lease.expires_at = Some(Utc::now() + duration);
        Some(lease.clone())
    }

    /// Removes the MAC's lease and releases its address. Returns true when
    /// a lease was actually removed (the caller then persists).
    pub async fn free_lease(&self, mac: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(lease) = state.leases.remove(mac) else {
            return false;
        };
        if self.in_active_range(lease.ip) {
            state
                .active_bits
                .clear(ip_distance(self.active_start, lease.ip) as usize);
        }
        true
    }

    /// Installs a binding, releasing any previous reservation for the MAC
    /// and holding the new address when it falls in the active range.
    pub(crate) async fn set_binding(&self, mut binding: Binding) -> Result<()> {
        binding.mac = binding.mac.to_lowercase();
        if !self.subnet.contains(binding.ip) {
            return Err(Error::AddressOutOfRange(binding.ip));
        }

        let mut state = self.state.write().await;
        if let Some(old) = state.bindings.get(&binding.mac)
            && self.in_active_range(old.ip)
        {
            let index = ip_distance(self.active_start, old.ip) as usize;
            state.active_bits.clear(index);
        }
        if self.in_active_range(binding.ip) {
            let index = ip_distance(self.active_start, binding.ip) as usize;
            state.active_bits.set(index);
        }
        state.bindings.insert(binding.mac.clone(), binding);
        Ok(())
    }

    pub(crate) async fn remove_binding(&self, mac: &str) -> Result<()> {
        let mac = mac.to_lowercase();
        let mut state = self.state.write().await;
        let Some(binding) = state.bindings.remove(&mac) else {
            return Err(Error::NotFound(format!("binding {mac}")));
        };
        if self.in_active_range(binding.ip) {
            let index = ip_distance(self.active_start, binding.ip) as usize;
            state.active_bits.clear(index);
        }
        Ok(())
    }

    /// Points every binding holding `ip` at a new boot server. Returns true
    /// when anything actually changed.
    pub(crate) async fn update_next_server(&self, ip: Ipv4Addr, next_server: Ipv4Addr) -> bool {
        let mut state = self.state.write().await;
        let mut changed = false;
        for binding in state.bindings.values_mut() {
            if binding.ip == ip && binding.next_server != Some(next_server) {
                binding.next_server = Some(next_server);
                changed = true;
            }
        }
        changed
    }

    /// Takes over another subnet's leases, bindings, and held-address bits
    /// wholesale; the range is deliberately not re-derived.
    pub(crate) async fn carry_state_from(&self, old: &Subnet) {
        let old_state = old.state.read().await.clone();
        *self.state.write().await = old_state;
    }

    /// Renders the reply option set for a client.
    ///
    /// Subnet options first, then binding options on top; render failures
    /// are logged and skipped. Renewal and rebinding times are derived from
    /// the lease duration last, so templates cannot override them.
    pub fn build_options(
        &self,
        binding: Option<&Binding>,
        packet: &DhcpPacket,
    ) -> (BTreeMap<u8, Vec<u8>>, TimeDelta) {
        let lease_time = self.lease_duration(binding);
        let src_opts = packet.decoded_options();
        let mut opts = BTreeMap::new();

        for template in &self.options {
            match template.render(&src_opts) {
                Ok((code, bytes)) => {
                    opts.insert(code, bytes);
                }
                Err(error) => warn!(subnet = %self.name, %error, "Skipping subnet option"),
            }
        }

        if let Some(binding) = binding {
            for template in &binding.options {
                match template.render(&src_opts) {
                    Ok((code, bytes)) => {
                        opts.insert(code, bytes);
                    }
                    Err(error) => warn!(subnet = %self.name, %error, "Skipping binding option"),
                }
            }
        }

        let seconds = lease_time.num_seconds() as u32;
        opts.insert(
            OptionCode::RenewalTime as u8,
            (seconds / 2).to_be_bytes().to_vec(),
        );
        opts.insert(
            OptionCode::RebindingTime as u8,
            (seconds * 3 / 4).to_be_bytes().to_vec(),
        );

        (opts, lease_time)
    }
}

fn in_range(start: Ipv4Addr, end: Ipv4Addr, ip: Ipv4Addr) -> bool {
    u32::from(start) <= u32::from(ip) && u32::from(ip) <= u32::from(end)
}
