use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Client-side view of one server permission. The server expires a
/// permission after about five minutes; the client refreshes every four.
pub(crate) struct Permission {
    pub(crate) installed: bool,
    pub(crate) last_sent_at: Instant,
    /// Payloads queued while the permission install is outstanding.
    pub(crate) pending: Vec<(SocketAddr, Vec<u8>)>,
}

impl Permission {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            installed: false,
            last_sent_at: now,
            pending: vec![],
        }
    }
}

/// Permissions keyed by peer IP, the granularity the server enforces.
#[derive(Default)]
pub(crate) struct PermissionMap {
    permissions: HashMap<IpAddr, Permission>,
}

impl PermissionMap {
    pub(crate) fn new() -> Self {
        Self {
            permissions: HashMap::new(),
        }
    }

    pub(crate) fn entry(&mut self, peer: IpAddr, now: Instant) -> &mut Permission {
        self.permissions
            .entry(peer)
            .or_insert_with(|| Permission::new(now))
    }

    pub(crate) fn get(&self, peer: &IpAddr) -> Option<&Permission> {
        self.permissions.get(peer)
    }

    pub(crate) fn get_mut(&mut self, peer: &IpAddr) -> Option<&mut Permission> {
        self.permissions.get_mut(peer)
    }

    pub(crate) fn contains(&self, peer: &IpAddr) -> bool {
        self.permissions.contains_key(peer)
    }

    pub(crate) fn remove(&mut self, peer: &IpAddr) -> Option<Permission> {
        self.permissions.remove(peer)
    }

    pub(crate) fn ips(&self) -> Vec<IpAddr> {
        self.permissions.keys().copied().collect()
    }

    /// Peers with no confirmed install, preferred when batching.
    pub(crate) fn uninstalled_ips(&self) -> Vec<IpAddr> {
        self.permissions
            .iter()
            .filter(|(_, permission)| !permission.installed)
            .map(|(ip, _)| *ip)
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.permissions.clear();
    }
}
