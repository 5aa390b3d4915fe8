use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Schema facts about one message id that framing depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Message id.
    pub id: u32,
    /// Seed byte folded into the checksum after the payload.
    pub crc_extra: u8,
    /// Payload length without extension fields.
    pub min_len: u8,
    /// Full payload length including extensions (the untrimmed length).
    pub max_len: u8,
}

impl MessageInfo {
    pub const fn new(id: u32, crc_extra: u8, min_len: u8, max_len: u8) -> Self {
        Self {
            id,
            crc_extra,
            min_len,
            max_len,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.min_len > self.max_len {
            return Err(FrameError::InvalidDefinition {
                id: self.id,
                reason: format!("min_len {} exceeds max_len {}", self.min_len, self.max_len),
            });
        }
        if self.id > 0x00FF_FFFF {
            return Err(FrameError::InvalidDefinition {
                id: self.id,
                reason: "id does not fit in 24 bits".to_string(),
            });
        }
        Ok(())
    }
}

/// Lookup of message definitions by id.
pub trait MessageTable: Send + Sync {
    fn lookup(&self, msgid: u32) -> Option<MessageInfo>;
}

/// A mutable message-definition table.
///
/// Starts from the built-in common set (see [`MessageRegistry::common`]) and
/// can be extended with dialect files.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    entries: HashMap<u32, MessageInfo>,
}

impl MessageRegistry {
    /// A registry with no definitions at all.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A registry preloaded with the common message set.
    pub fn common() -> Self {
        let mut registry = Self::empty();
        for info in COMMON_MESSAGES {
            registry.entries.insert(info.id, *info);
        }
        registry
    }

    /// Add or replace one definition, returning the previous one.
    pub fn insert(&mut self, info: MessageInfo) -> Result<Option<MessageInfo>> {
        info.validate()?;
        Ok(self.entries.insert(info.id, info))
    }

    /// Merge definitions from a JSON array of `{id, crc_extra, min_len, max_len}`.
    ///
    /// Returns how many definitions were read. Nothing is merged when any
    /// entry is invalid.
    pub fn extend_from_json(&mut self, json: &[u8]) -> Result<usize> {
        let infos: Vec<MessageInfo> = serde_json::from_slice(json)?;
        for info in &infos {
            info.validate()?;
        }
        let count = infos.len();
        self.entries
            .extend(infos.into_iter().map(|info| (info.id, info)));
        Ok(count)
    }

    /// Merge definitions from a JSON dialect file.
    pub fn load_dialect(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let bytes = std::fs::read(path)?;
        self.extend_from_json(&bytes)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::common()
    }
}

impl MessageTable for MessageRegistry {
    fn lookup(&self, msgid: u32) -> Option<MessageInfo> {
        self.entries.get(&msgid).copied()
    }
}

impl<T: MessageTable + ?Sized> MessageTable for std::sync::Arc<T> {
    fn lookup(&self, msgid: u32) -> Option<MessageInfo> {
        (**self).lookup(msgid)
    }
}

/// Common-set definitions most autopilots and ground stations exchange.
pub const COMMON_MESSAGES: &[MessageInfo] = &[
    MessageInfo::new(0, 50, 9, 9),      // HEARTBEAT
    MessageInfo::new(1, 124, 31, 43),   // SYS_STATUS
    MessageInfo::new(2, 137, 12, 12),   // SYSTEM_TIME
    MessageInfo::new(4, 237, 14, 14),   // PING
    MessageInfo::new(5, 217, 28, 28),   // CHANGE_OPERATOR_CONTROL
    MessageInfo::new(6, 104, 3, 3),     // CHANGE_OPERATOR_CONTROL_ACK
    MessageInfo::new(7, 119, 32, 32),   // AUTH_KEY
    MessageInfo::new(11, 89, 6, 6),     // SET_MODE
    MessageInfo::new(20, 214, 20, 20),  // PARAM_REQUEST_READ
    MessageInfo::new(21, 159, 2, 2),    // PARAM_REQUEST_LIST
    MessageInfo::new(22, 220, 25, 25),  // PARAM_VALUE
    MessageInfo::new(23, 168, 23, 23),  // PARAM_SET
    MessageInfo::new(24, 24, 30, 52),   // GPS_RAW_INT
    MessageInfo::new(25, 23, 101, 101), // GPS_STATUS
    MessageInfo::new(26, 170, 22, 24),  // SCALED_IMU
    MessageInfo::new(27, 144, 26, 29),  // RAW_IMU
    MessageInfo::new(29, 115, 14, 16),  // SCALED_PRESSURE
    MessageInfo::new(30, 39, 28, 28),   // ATTITUDE
    MessageInfo::new(31, 246, 32, 48),  // ATTITUDE_QUATERNION
    MessageInfo::new(32, 185, 28, 28),  // LOCAL_POSITION_NED
    MessageInfo::new(33, 104, 28, 28),  // GLOBAL_POSITION_INT
    MessageInfo::new(34, 237, 22, 22),  // RC_CHANNELS_SCALED
    MessageInfo::new(35, 244, 22, 22),  // RC_CHANNELS_RAW
    MessageInfo::new(36, 222, 21, 37),  // SERVO_OUTPUT_RAW
    MessageInfo::new(39, 254, 37, 38),  // MISSION_ITEM
    MessageInfo::new(40, 230, 4, 5),    // MISSION_REQUEST
    MessageInfo::new(62, 183, 26, 26),  // NAV_CONTROLLER_OUTPUT
    MessageInfo::new(65, 118, 42, 42),  // RC_CHANNELS
    MessageInfo::new(66, 148, 6, 6),    // REQUEST_DATA_STREAM
    MessageInfo::new(73, 38, 37, 38),   // MISSION_ITEM_INT
    MessageInfo::new(74, 20, 20, 20),   // VFR_HUD
    MessageInfo::new(75, 158, 35, 35),  // COMMAND_INT
    MessageInfo::new(76, 152, 33, 33),  // COMMAND_LONG
    MessageInfo::new(77, 143, 3, 10),   // COMMAND_ACK
    MessageInfo::new(87, 150, 51, 51),  // POSITION_TARGET_GLOBAL_INT
    MessageInfo::new(105, 93, 62, 63),  // HIGHRES_IMU
    MessageInfo::new(109, 185, 9, 9),   // RADIO_STATUS
    MessageInfo::new(111, 34, 16, 18),  // TIMESYNC
    MessageInfo::new(125, 203, 6, 6),   // POWER_STATUS
    MessageInfo::new(147, 154, 36, 54), // BATTERY_STATUS
    MessageInfo::new(148, 178, 60, 78), // AUTOPILOT_VERSION
    MessageInfo::new(230, 163, 42, 42), // ESTIMATOR_STATUS
    MessageInfo::new(241, 90, 32, 32),  // VIBRATION
    MessageInfo::new(242, 104, 52, 60), // HOME_POSITION
    MessageInfo::new(245, 130, 2, 2),   // EXTENDED_SYS_STATE
    MessageInfo::new(253, 83, 51, 54),  // STATUSTEXT
    MessageInfo::new(254, 46, 9, 9),    // DEBUG
];
