use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form description of a registered machine (os, arch, hostname, cpu_count, ...).
pub type InstanceMeta = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: i64,
    pub port_number: u16,
    pub is_reserved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub meta: InstanceMeta,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub id: i64,
    pub instance_id: String,
    pub start_port: u16,
    pub end_port: u16,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl PortBinding {
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    /// Number of ports covered, both ends inclusive.
    pub fn size(&self) -> u32 {
        u32::from(self.end_port) - u32::from(self.start_port) + 1
    }

    pub fn port_numbers(&self) -> impl Iterator<Item = u16> {
        self.start_port..=self.end_port
    }
}

/// Renders `8000` for single-port bindings and `8000:8002` for ranges.
impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_port == self.end_port {
            write!(f, "{}", self.start_port)
        } else {
            write!(f, "{}:{}", self.start_port, self.end_port)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    pub instance_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub meta: InstanceMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub instance_id: Option<String>,
    /// Number of contiguous ports; a single port when absent.
    pub range: Option<i64>,
}

/// Either `port_number` or both `start_port` and `end_port` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub instance_id: Option<String>,
    pub port_number: Option<u16>,
    pub start_port: Option<u16>,
    pub end_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservedPortsRequest {
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortQuery {
    pub is_reserved: Option<bool>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingQuery {
    pub instance_id: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(start_port: u16, end_port: u16) -> PortBinding {
        PortBinding {
            id: 1,
            instance_id: "abc".to_string(),
            start_port,
            end_port,
            created_at: Utc::now(),
            released_at: None,
        }
    }

    #[test]
    fn test_binding_display() {
        assert_eq!(binding(8000, 8000).to_string(), "8000");
        assert_eq!(binding(8000, 8002).to_string(), "8000:8002");
    }

    #[test]
    fn test_binding_size_and_ports() {
        let b = binding(8000, 8002);
        assert_eq!(b.size(), 3);
        assert_eq!(b.port_numbers().collect::<Vec<_>>(), vec![8000, 8001, 8002]);
        assert!(b.is_active());
    }

    #[test]
    fn test_reserve_request_defaults_to_single_port() {
        let req: ReserveRequest = serde_json::from_str(r#"{"instance_id":"abc"}"#).unwrap();
        assert_eq!(req.instance_id.as_deref(), Some("abc"));
        assert!(req.range.is_none());
    }
}
