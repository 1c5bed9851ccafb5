//! Device and endpoint records

use serde::{Deserialize, Serialize};

use crate::uid::DeviceUid;

/// Maximum endpoints retained per device.
pub const MAX_ENDPOINTS_PER_DEVICE: usize = 8;
/// Maximum clusters per server/client list.
pub const MAX_CLUSTERS_PER_LIST: usize = 16;
/// Maximum stored device-name length (bytes, excluding terminator).
pub const MAX_NAME_LEN: usize = 31;

/// Short network address value meaning "unknown / not associated".
pub const SHORT_ADDR_UNKNOWN: u16 = 0xFFFF;

/// One application endpoint of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Endpoint ID (1-240)
    pub endpoint: u8,
    /// Profile ID (e.g., 0x0104 for Home Automation)
    pub profile_id: u16,
    /// Device ID within the profile
    pub device_id: u16,
    /// Server ("in") clusters; insertion order kept for display,
    /// membership is what matters
    pub in_clusters: Vec<u16>,
    /// Client ("out") clusters
    pub out_clusters: Vec<u16>,
}

impl EndpointRecord {
    #[must_use]
    pub fn new(endpoint: u8, profile_id: u16, device_id: u16) -> Self {
        Self {
            endpoint,
            profile_id,
            device_id,
            in_clusters: Vec::new(),
            out_clusters: Vec::new(),
        }
    }

    /// Membership in the server cluster list.
    #[must_use]
    pub fn has_in_cluster(&self, cluster_id: u16) -> bool {
        self.in_clusters.contains(&cluster_id)
    }

    /// Membership in the client cluster list.
    #[must_use]
    pub fn has_out_cluster(&self, cluster_id: u16) -> bool {
        self.out_clusters.contains(&cluster_id)
    }

    /// Add a server cluster, respecting the bounded list.
    pub fn push_in_cluster(&mut self, cluster_id: u16) {
        if !self.has_in_cluster(cluster_id) && self.in_clusters.len() < MAX_CLUSTERS_PER_LIST {
            self.in_clusters.push(cluster_id);
        }
    }

    /// Add a client cluster, respecting the bounded list.
    pub fn push_out_cluster(&mut self, cluster_id: u16) {
        if !self.has_out_cluster(cluster_id) && self.out_clusters.len() < MAX_CLUSTERS_PER_LIST {
            self.out_clusters.push(cluster_id);
        }
    }
}

/// Authoritative record for one known device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable identity (EUI-64)
    pub uid: DeviceUid,
    /// Current network short address; `0xFFFF` when unknown
    pub short_addr: u16,
    /// Human name, bounded to [`MAX_NAME_LEN`]
    pub name: String,
    /// Monotonic ms since boot at last contact
    pub last_seen_ms: u64,
    /// Device carries an On/Off server somewhere
    pub has_onoff: bool,
    /// Device emits On/Off client commands (button-style)
    pub has_button: bool,
    /// Endpoint table, bounded to [`MAX_ENDPOINTS_PER_DEVICE`]
    pub endpoints: Vec<EndpointRecord>,
}

impl DeviceRecord {
    #[must_use]
    pub fn new(uid: DeviceUid, short_addr: u16) -> Self {
        Self {
            uid,
            short_addr,
            name: String::new(),
            last_seen_ms: 0,
            has_onoff: false,
            has_button: false,
            endpoints: Vec::new(),
        }
    }

    /// Whether the device can be targeted right now.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.short_addr != 0 && self.short_addr != SHORT_ADDR_UNKNOWN
    }

    /// Replace-or-insert an endpoint by id, respecting the bound.
    pub fn upsert_endpoint(&mut self, ep: EndpointRecord) {
        if let Some(existing) = self.endpoints.iter_mut().find(|e| e.endpoint == ep.endpoint) {
            *existing = ep;
        } else if self.endpoints.len() < MAX_ENDPOINTS_PER_DEVICE {
            self.endpoints.push(ep);
        }
    }

    /// Merge another record for the same device into this one.
    ///
    /// Used when duplicate UIDs are found on load: keep the newer
    /// `last_seen_ms`, the non-empty name, and the union of capability
    /// bits and endpoint metadata.
    pub fn merge(&mut self, other: &DeviceRecord) {
        if other.last_seen_ms > self.last_seen_ms {
            self.last_seen_ms = other.last_seen_ms;
            if other.is_ready() {
                self.short_addr = other.short_addr;
            }
        }
        if self.name.is_empty() && !other.name.is_empty() {
            self.name.clone_from(&other.name);
        }
        self.has_onoff |= other.has_onoff;
        self.has_button |= other.has_button;
        for ep in &other.endpoints {
            if !self.endpoints.iter().any(|e| e.endpoint == ep.endpoint) {
                if self.endpoints.len() >= MAX_ENDPOINTS_PER_DEVICE {
                    break;
                }
                self.endpoints.push(ep.clone());
            }
        }
    }

    /// Bound the name to the storable length.
    pub fn set_name(&mut self, name: &str) {
        let mut trimmed = name.to_string();
        trimmed.truncate(MAX_NAME_LEN);
        self.name = trimmed;
    }
}
