//! The UDP announcement datagram.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::error::SyncError;
use crate::sync::peer_types::{PeerId, PeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnouncementType {
    #[serde(rename = "device_announcement", alias = "announce")]
    DeviceAnnouncement,
}

/// `{type, deviceId, deviceName, ipAddress, port, timestamp}`.
///
/// The older `announce` form with `peerId`, `displayName` and `address`
/// is accepted on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    #[serde(rename = "type")]
    pub kind: AnnouncementType,
    #[serde(alias = "peerId")]
    pub device_id: PeerId,
    #[serde(alias = "displayName")]
    pub device_name: String,
    #[serde(alias = "address", default)]
    pub ip_address: String,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
}

impl Announcement {
    pub fn new(local: &PeerInfo, now: DateTime<Utc>) -> Self {
        Self {
            kind: AnnouncementType::DeviceAnnouncement,
            device_id: local.peer_id.clone(),
            device_name: local.display_name.clone(),
            ip_address: local.address.clone(),
            port: local.port,
            timestamp: now,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SyncError> {
        let announcement: Self = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::DataCorrupted(format!("malformed announcement: {e}")))?;
        if announcement.device_id.is_empty() {
            return Err(SyncError::ValidationFailed(
                "announcement without device id".to_string(),
            ));
        }
        Ok(announcement)
    }

    /// Peer entry for this announcement, falling back to the datagram's
    /// source when no address was advertised.
    pub fn into_peer_info(self, source: IpAddr, now: DateTime<Utc>) -> PeerInfo {
        let address = if self.ip_address.is_empty() {
            source.to_string()
        } else {
            self.ip_address
        };
        PeerInfo::new(self.device_id, self.device_name, address, self.port, now)
    }
}
