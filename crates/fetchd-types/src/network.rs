use serde::{Deserialize, Serialize};

/// Kind of link the host is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bearer {
    Wired,
    Wifi,
    Mobile,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub online: bool,
    pub bearer: Bearer,
}

impl NetworkStatus {
    pub const ONLINE: Self = Self {
        online: true,
        bearer: Bearer::Unknown,
    };

    pub const OFFLINE: Self = Self {
        online: false,
        bearer: Bearer::Unknown,
    };

    /// Whether a transfer with the given mobile-data policy may use the link.
    pub fn usable(self, allow_mobile: bool) -> bool {
        self.online && (self.bearer != Bearer::Mobile || allow_mobile)
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::ONLINE
    }
}
