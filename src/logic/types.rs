//! Core Types
//!
//! Identity and classification types shared by every engine.
//! KHÔNG chứa logic - chỉ data structures.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// IDENTITY
// ============================================================================

/// Switch datapath identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchId(pub u64);

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// Switch port number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNo(pub u32);

impl fmt::Display for PortNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flow table identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u8);

/// (switch, port) identity of an access port. Key of every per-port map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwitchPort {
    pub switch: SwitchId,
    pub port: PortNo,
}

impl SwitchPort {
    pub fn new(switch: SwitchId, port: PortNo) -> Self {
        Self { switch, port }
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.switch, self.port)
    }
}

/// Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address: {}", s));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address: {}", s))?;
        }
        Ok(MacAddr(bytes))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// Address binding: which host (MAC + IPv6) sits behind which access port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub switch_port: SwitchPort,
    pub mac: MacAddr,
    pub address: Ipv6Addr,
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Trust state of an access port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    /// Trusted, forwarded without dynamic verification
    Normal,
    /// Under active verification
    Observation,
    /// Verification failed, rules stay installed
    Abnormal,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Normal => "normal",
            PortState::Observation => "observation",
            PortState::Abnormal => "abnormal",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a switch takes part in dynamic verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SwitchRole {
    /// Dynamic verification rules are churned by the classifier
    #[default]
    Managed,
    /// Fixed static verification rules, never polled for flows
    StaticallyTrusted,
    /// Default/fallback switch, no verification rules at all
    Fallback,
}

impl SwitchRole {
    /// Only managed switches take part in polling, classification and credit
    pub fn is_dynamic(&self) -> bool {
        matches!(self, SwitchRole::Managed)
    }
}

/// Active detection plan. Exactly one runs per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionPlan {
    /// Drop-rate / drop-count of verification rules
    LossRate,
    /// Ingress peak vs. sibling egress correlation
    Traffic,
}

impl DetectionPlan {
    /// Numeric code used by the admin surface (1 = loss rate, 2 = traffic)
    pub fn code(&self) -> u8 {
        match self {
            DetectionPlan::LossRate => 1,
            DetectionPlan::Traffic => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DetectionPlan::LossRate),
            2 => Some(DetectionPlan::Traffic),
            _ => None,
        }
    }
}

impl FromStr for DetectionPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lossrate" | "loss_rate" | "1" => Ok(DetectionPlan::LossRate),
            "traffic" | "2" => Ok(DetectionPlan::Traffic),
            other => Err(format!("unknown detection plan: {}", other)),
        }
    }
}

/// Per-cycle verdict for one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Good,
    Bad,
    /// No counters for this port yet; neutral for every transition
    NoData,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "00:1a:2b:3c:4d:5e".parse().unwrap();
        assert_eq!(mac.0, [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");
        assert!("00:1a:2b".parse::<MacAddr>().is_err());
        assert!("zz:1a:2b:3c:4d:5e".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_switch_port_display() {
        let sp = SwitchPort::new(SwitchId(2), PortNo(3));
        assert_eq!(sp.to_string(), "00:00:00:00:00:00:00:02-3");
    }

    #[test]
    fn test_switch_port_equality_by_value() {
        let a = SwitchPort::new(SwitchId(1), PortNo(1));
        let b = SwitchPort::new(SwitchId(1), PortNo(1));
        assert_eq!(a, b);
        assert_ne!(a, SwitchPort::new(SwitchId(1), PortNo(2)));
    }

    #[test]
    fn test_plan_codes() {
        assert_eq!(DetectionPlan::from_code(1), Some(DetectionPlan::LossRate));
        assert_eq!(DetectionPlan::from_code(2), Some(DetectionPlan::Traffic));
        assert_eq!(DetectionPlan::from_code(3), None);
        assert_eq!("traffic".parse::<DetectionPlan>(), Ok(DetectionPlan::Traffic));
    }

    #[test]
    fn test_role_dynamic() {
        assert!(SwitchRole::Managed.is_dynamic());
        assert!(!SwitchRole::StaticallyTrusted.is_dynamic());
        assert!(!SwitchRole::Fallback.is_dynamic());
    }

    #[test]
    fn test_binding_json() {
        let json = r#"{
            "switch_port": {"switch": 2, "port": 1},
            "mac": "00:00:00:00:00:01",
            "address": "2001:db8::1"
        }"#;
        let b: Binding = serde_json::from_str(json).unwrap();
        assert_eq!(b.switch_port, SwitchPort::new(SwitchId(2), PortNo(1)));
        assert_eq!(b.mac.0[5], 1);
    }
}
