use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Business area a request belongs to. The set is closed: contract parsing
/// rejects anything outside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Quote,
    Shipment,
    Support,
    Crm,
    Outreach,
    Listini,
    Mentor,
    Debug,
    Explain,
}

impl Domain {
    pub const ALL: [Domain; 9] = [
        Self::Quote,
        Self::Shipment,
        Self::Support,
        Self::Crm,
        Self::Outreach,
        Self::Listini,
        Self::Mentor,
        Self::Debug,
        Self::Explain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Shipment => "shipment",
            Self::Support => "support",
            Self::Crm => "crm",
            Self::Outreach => "outreach",
            Self::Listini => "listini",
            Self::Mentor => "mentor",
            Self::Debug => "debug",
            Self::Explain => "explain",
        }
    }

    /// The only channel a request in this domain may be routed to.
    pub fn channel(&self) -> Channel {
        match self {
            Self::Quote => Channel::Quote,
            Self::Shipment => Channel::CreateShipment,
            Self::Support => Channel::Support,
            Self::Crm => Channel::Crm,
            Self::Outreach => Channel::Outreach,
            Self::Listini => Channel::Listini,
            Self::Mentor => Channel::Mentor,
            Self::Debug => Channel::Debug,
            Self::Explain => Channel::Explain,
        }
    }

    pub fn env_suffix(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|domain| domain.as_str() == key)
            .ok_or_else(|| format!("unsupported domain `{key}`"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Quote,
    CreateShipment,
    Support,
    Crm,
    Outreach,
    Listini,
    Mentor,
    Debug,
    Explain,
}

impl Channel {
    pub const ALL: [Channel; 9] = [
        Self::Quote,
        Self::CreateShipment,
        Self::Support,
        Self::Crm,
        Self::Outreach,
        Self::Listini,
        Self::Mentor,
        Self::Debug,
        Self::Explain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::CreateShipment => "create_shipment",
            Self::Support => "support",
            Self::Crm => "crm",
            Self::Outreach => "outreach",
            Self::Listini => "listini",
            Self::Mentor => "mentor",
            Self::Debug => "debug",
            Self::Explain => "explain",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str() == key)
            .ok_or_else(|| format!("unsupported channel `{key}`"))
    }
}

/// Ordinal severity attached to tools and decisions: low < medium < high < critical.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }

    pub fn escalate(self, observed: RiskLevel) -> RiskLevel {
        self.max(observed)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|risk| risk.as_str() == key)
            .ok_or_else(|| format!("unsupported risk level `{key}`"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestClassification {
    pub domain: Domain,
    pub channel: Channel,
    pub intent_id: String,
    pub reason: String,
    pub confidence: u8,
}

impl RequestClassification {
    /// Placeholder used until the classifier stage succeeds, so that every
    /// exit path can still build metadata.
    pub fn bootstrap() -> Self {
        Self {
            domain: Domain::Support,
            channel: Channel::Support,
            intent_id: "support.request".to_string(),
            reason: "bootstrap".to_string(),
            confidence: 0,
        }
    }
}
