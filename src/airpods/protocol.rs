//! AAP protocol definitions and data structures.
//!
//! Opcodes, packet templates and the value types carried by the accessory
//! protocol. The table below is reverse-engineered; nothing outside
//! `airpods::protocol` and `airpods::codec` depends on byte layouts.

use std::{fmt, str::FromStr, sync::LazyLock};

use serde::{Deserialize, Serialize};
use serde_json::json;

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4d, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_REQUEST_NOTIFY: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff,
];

// Service headers
pub const HDR_HANDSHAKE_REPLY: &[u8] = b"\x01\x00\x04\x00";
pub const HDR_DATA: &[u8] = b"\x04\x00\x04\x00";
pub const HDR_LEN: usize = 4;

// Data record opcodes (little-endian u16 after the service header)
pub const OP_BATTERY: u16 = 0x0004;
pub const OP_EAR_DETECTION: u16 = 0x0006;
pub const OP_CONTROL: u16 = 0x0009;
pub const OP_METADATA: u16 = 0x001d;
pub const OP_FEATURES_ACK: u16 = 0x002b;

/// Length of a control-setting record: header, opcode, setting id, 4 value bytes.
pub const CONTROL_LEN: usize = HDR_LEN + 2 + 1 + 4;
/// Length of an ear-detection record: header, opcode, primary, secondary.
pub const EAR_DETECTION_LEN: usize = HDR_LEN + 2 + 2;
/// Battery records: header, opcode, count, then `count` 5-byte entries.
pub const BATTERY_PREFIX_LEN: usize = HDR_LEN + 2 + 1;
pub const BATTERY_ENTRY_LEN: usize = 5;
pub const MAX_BATTERY_ENTRIES: usize = 4;

/// Control setting id of the noise control mode.
pub const SETTING_NOISE_CONTROL: u8 = 0x0D;

/// Battery-bearing parts of an accessory.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Headphone = 0x01,
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Battery status for a component.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryStatus {
   Normal = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Noise control modes.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
#[repr(u32)]
pub enum NoiseControlMode {
   #[strum(to_string = "off")]
   Off = 0x01,
   #[strum(to_string = "anc", serialize = "nc")]
   Anc = 0x02,
   #[strum(to_string = "transparency", serialize = "trans")]
   Transparency = 0x03,
   #[strum(to_string = "adaptive", serialize = "adapt")]
   Adaptive = 0x04,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Sorted by id.
pub const KNOWN_FEATURES: &[(u8, &str)] = &[
   (FeatureId::NOISE_CONTROL.id(), "noise_control"),
   (FeatureId::ONE_BUD_ANC.id(), "one_bud_anc"),
   (FeatureId::VOLUME_INTERVAL.id(), "volume_interval"),
   (FeatureId::VOLUME_SWIPE.id(), "volume_swipe"),
   (FeatureId::ADAPTIVE_VOLUME.id(), "adaptive_volume"),
   (FeatureId::CONVERSATIONAL.id(), "conversational"),
   (FeatureId::HEARING_ASSIST.id(), "hearing_assist"),
   (FeatureId::ALLOW_OFF.id(), "allow_off"),
];

/// A control setting id that can be toggled on the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FeatureId(u8);

impl FromStr for FeatureId {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      for (repr, name) in KNOWN_FEATURES {
         if name.eq_ignore_ascii_case(s) {
            return Ok(Self(*repr));
         }
      }
      Err(strum::ParseError::VariantNotFound)
   }
}

static U8_TO_HEX: LazyLock<[[u8; 2]; 256]> = LazyLock::new(|| {
   let mut featids = [[0u8; 2]; 256];
   for i in 0..=255u8 {
      const fn nibble_to_hex(n: u8) -> u8 {
         if n < 10 { n + b'0' } else { n - 10 + b'a' }
      }
      featids[i as usize] = [nibble_to_hex(i >> 4), nibble_to_hex(i & 0x0f)];
   }
   featids
});

impl FeatureId {
   pub const NOISE_CONTROL: Self = Self(0x0D);
   pub const ONE_BUD_ANC: Self = Self(0x1B);
   pub const VOLUME_INTERVAL: Self = Self(0x23);
   pub const VOLUME_SWIPE: Self = Self(0x25);
   pub const ADAPTIVE_VOLUME: Self = Self(0x26);
   pub const CONVERSATIONAL: Self = Self(0x28);
   pub const HEARING_ASSIST: Self = Self(0x33);
   pub const ALLOW_OFF: Self = Self(0x34);

   pub const fn from_id(repr: u8) -> Self {
      Self(repr)
   }

   pub const fn id(self) -> u8 {
      self.0
   }

   pub const fn bitpos(self) -> (usize, u64) {
      let idx = self.0 as usize >> 6;
      let mask = 1 << (self.0 as usize & 0x3f);
      (idx, mask)
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      let i = KNOWN_FEATURES
         .binary_search_by_key(&self.0, |(repr, _)| *repr)
         .ok()?;
      Some(KNOWN_FEATURES[i].1)
   }

   /// Known name, or the id in hex for features nobody has named yet.
   pub fn to_str(self) -> &'static str {
      self
         .try_to_str()
         .unwrap_or_else(|| str::from_utf8(&U8_TO_HEX[self.0 as usize]).unwrap_or("??"))
   }
}

impl fmt::Display for FeatureId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.to_str())
   }
}

/// A battery percentage, guaranteed to lie in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Percent(u8);

impl Percent {
   pub const fn new(level: u8) -> Option<Self> {
      if level <= 100 { Some(Self(level)) } else { None }
   }

   pub const fn get(self) -> u8 {
      self.0
   }
}

/// Battery state for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryState {
   pub level: Percent,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }
}

/// Battery information for all components; `None` means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatteryInfo {
   pub left: Option<BatteryState>,
   pub right: Option<BatteryState>,
   pub case: Option<BatteryState>,
   pub headphone: Option<BatteryState>,
}

impl BatteryInfo {
   pub const fn new() -> Self {
      Self {
         left: None,
         right: None,
         case: None,
         headphone: None,
      }
   }

   pub const fn slot_mut(&mut self, component: Component) -> &mut Option<BatteryState> {
      match component {
         Component::Left => &mut self.left,
         Component::Right => &mut self.right,
         Component::Case => &mut self.case,
         Component::Headphone => &mut self.headphone,
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      let level = |s: Option<BatteryState>| s.map(|s| s.level.get());
      let charging = |s: Option<BatteryState>| s.is_some_and(|s| s.is_charging());
      json!({
          "left_level": level(self.left),
          "right_level": level(self.right),
          "case_level": level(self.case),
          "headphone_level": level(self.headphone),
          "left_charging": charging(self.left),
          "right_charging": charging(self.right),
          "case_charging": charging(self.case),
          "headphone_charging": charging(self.headphone),
          "left_available": self.left.is_some(),
          "right_available": self.right.is_some(),
          "case_available": self.case.is_some(),
          "headphone_available": self.headphone.is_some(),
      })
   }
}

impl fmt::Display for BatteryInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let parts = [
         ("L", self.left),
         ("R", self.right),
         ("C", self.case),
         ("H", self.headphone),
      ];
      let mut first = true;
      for (tag, state) in parts {
         let Some(state) = state else { continue };
         if !first {
            f.write_str(" ")?;
         }
         first = false;
         write!(f, "{tag}:{}%", state.level.get())?;
         if state.is_charging() {
            f.write_str("+")?;
         }
      }
      if first {
         f.write_str("unknown")?;
      }
      Ok(())
   }
}

/// Ear detection status for left and right earpieces.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
pub struct EarDetectionStatus {
   pub left_in_ear: bool,
   pub right_in_ear: bool,
}

impl EarDetectionStatus {
   pub const fn new(left_in_ear: bool, right_in_ear: bool) -> Self {
      Self {
         left_in_ear,
         right_in_ear,
      }
   }

   pub const fn any_in_ear(&self) -> bool {
      self.left_in_ear || self.right_in_ear
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_in_ear": self.left_in_ear,
          "right_in_ear": self.right_in_ear,
      })
   }
}

/// A command the outside world can send to one accessory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
   SetNoiseMode(NoiseControlMode),
   SetFeature(FeatureId, bool),
   RequestBattery,
   Passthrough(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FeatureCmd {
   Query = 0,
   Enable = 1,
   Disable = 2,
}

impl FeatureCmd {
   pub const fn from_repr(value: u32) -> Option<Self> {
      match value {
         0 => Some(Self::Query),
         1 => Some(Self::Enable),
         2 => Some(Self::Disable),
         _ => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn noise_mode_names_round_through_strings() {
      assert_eq!(NoiseControlMode::Anc.to_str(), "anc");
      assert_eq!(NoiseControlMode::Transparency.to_str(), "transparency");
      assert_eq!("nc".parse::<NoiseControlMode>(), Ok(NoiseControlMode::Anc));
      assert_eq!("ANC".parse::<NoiseControlMode>(), Ok(NoiseControlMode::Anc));
      assert_eq!(
         "adapt".parse::<NoiseControlMode>(),
         Ok(NoiseControlMode::Adaptive)
      );
      assert!("loud".parse::<NoiseControlMode>().is_err());
   }

   #[test]
   fn known_features_are_sorted_for_lookup() {
      assert!(KNOWN_FEATURES.windows(2).all(|w| w[0].0 < w[1].0));
      for (id, name) in KNOWN_FEATURES {
         assert_eq!(FeatureId::from_id(*id).to_str(), *name);
         assert_eq!(name.parse::<FeatureId>().map(FeatureId::id), Ok(*id));
      }
      assert_eq!(FeatureId::from_id(0x7a).to_str(), "7a");
   }

   #[test]
   fn percent_rejects_out_of_range() {
      assert_eq!(Percent::new(100).map(Percent::get), Some(100));
      assert!(Percent::new(101).is_none());
      assert!(Percent::new(0xff).is_none());
   }

   #[test]
   fn battery_json_reports_unknown_as_null() {
      let mut info = BatteryInfo::new();
      *info.slot_mut(Component::Left) = Some(BatteryState {
         level: Percent::new(80).unwrap(),
         status: BatteryStatus::Charging,
      });
      let json = info.to_json();
      assert_eq!(json["left_level"], 80);
      assert_eq!(json["left_charging"], true);
      assert!(json["right_level"].is_null());
      assert_eq!(json["case_available"], false);
      assert_eq!(info.to_string(), "L:80%+");
      assert_eq!(BatteryInfo::new().to_string(), "unknown");
   }
}
