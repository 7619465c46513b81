//! Live state of one accessory.
//!
//! A [`Device`] is owned and mutated by exactly one session task. Everyone
//! else sees clones of it, taken by the registry whenever the session reports
//! a change.

use std::{
   mem,
   time::{SystemTime, UNIX_EPOCH},
};

use bluer::Address;
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};

use crate::airpods::{
   protocol::{BatteryInfo, EarDetectionStatus, FeatureId, NoiseControlMode},
   session::SessionState,
};

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn apply(dst: &mut Option<T>, new: Option<T>) -> Self
   where
      T: Copy,
   {
      let prev = mem::replace(dst, new);
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   pub const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }

   pub const fn is_changed(&self) -> bool {
      !matches!(self, Self::Noop)
   }
}

/// Reported features and their enabled flags, as two 256-bit maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
   seen: [u64; 4],
   enabled: [u64; 4],
}

impl FeatureSet {
   pub const fn is_seen(&self, feature: FeatureId) -> bool {
      let (idx, mask) = feature.bitpos();
      self.seen[idx] & mask != 0
   }

   pub const fn is_enabled(&self, feature: FeatureId) -> bool {
      let (idx, mask) = feature.bitpos();
      self.enabled[idx] & mask != 0
   }

   /// Records a feature state; returns whether anything changed.
   pub const fn set(&mut self, feature: FeatureId, enabled: bool) -> bool {
      let (idx, mask) = feature.bitpos();
      let was_seen = self.seen[idx] & mask != 0;
      let was_enabled = self.enabled[idx] & mask != 0;
      self.seen[idx] |= mask;
      if enabled {
         self.enabled[idx] |= mask;
      } else {
         self.enabled[idx] &= !mask;
      }
      !was_seen || was_enabled != enabled
   }

   pub fn iter(&self) -> impl Iterator<Item = (FeatureId, bool)> + '_ {
      (0..=u8::MAX)
         .map(FeatureId::from_id)
         .filter(|f| self.is_seen(*f))
         .map(|f| (f, self.is_enabled(f)))
   }

   pub fn is_empty(&self) -> bool {
      self.seen.iter().all(|w| *w == 0)
   }

   pub const fn clear(&mut self) {
      self.seen = [0; 4];
      self.enabled = [0; 4];
   }
}

/// Snapshot-able record of one accessory.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
   address: Address,
   address_str: SmolStr,
   name: SmolStr,
   state: SessionState,
   battery: Option<BatteryInfo>,
   noise_mode: Option<NoiseControlMode>,
   ear_detection: Option<EarDetectionStatus>,
   features: FeatureSet,
   battery_ttl: Option<u32>,
   last_update: Option<SystemTime>,
}

impl Device {
   pub fn new(address: Address, name: impl Into<SmolStr>) -> Self {
      Self {
         address,
         address_str: address.to_smolstr(),
         name: name.into(),
         state: SessionState::Disconnected,
         battery: None,
         noise_mode: None,
         ear_detection: None,
         features: FeatureSet::default(),
         battery_ttl: None,
         last_update: None,
      }
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub const fn address_str(&self) -> &SmolStr {
      &self.address_str
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub const fn state(&self) -> SessionState {
      self.state
   }

   pub const fn is_connected(&self) -> bool {
      matches!(self.state, SessionState::Connected)
   }

   pub const fn battery(&self) -> Option<BatteryInfo> {
      self.battery
   }

   pub const fn noise_mode(&self) -> Option<NoiseControlMode> {
      self.noise_mode
   }

   pub const fn ear_detection(&self) -> Option<EarDetectionStatus> {
      self.ear_detection
   }

   pub const fn features(&self) -> &FeatureSet {
      &self.features
   }

   pub const fn battery_ttl(&self) -> Option<u32> {
      self.battery_ttl
   }

   fn touch(&mut self) {
      self.last_update = Some(SystemTime::now());
   }

   pub(crate) fn set_state(&mut self, state: SessionState) {
      if self.state != state {
         self.state = state;
         self.touch();
      }
   }

   pub fn update_name(&mut self, name: SmolStr) -> UpdateOp<SmolStr> {
      if self.name == name {
         return UpdateOp::Noop;
      }
      self.touch();
      UpdateOp::Updated(mem::replace(&mut self.name, name))
   }

   pub fn update_battery(&mut self, battery: impl Into<Option<BatteryInfo>>) -> UpdateOp<BatteryInfo> {
      let op = UpdateOp::apply(&mut self.battery, battery.into());
      if op.is_changed() {
         self.touch();
      }
      op
   }

   pub fn update_noise_mode(
      &mut self,
      mode: impl Into<Option<NoiseControlMode>>,
   ) -> UpdateOp<NoiseControlMode> {
      let op = UpdateOp::apply(&mut self.noise_mode, mode.into());
      if op.is_changed() {
         self.touch();
      }
      op
   }

   pub fn update_ear_detection(
      &mut self,
      status: impl Into<Option<EarDetectionStatus>>,
   ) -> UpdateOp<EarDetectionStatus> {
      let op = UpdateOp::apply(&mut self.ear_detection, status.into());
      if op.is_changed() {
         self.touch();
      }
      op
   }

   pub fn set_feature(&mut self, feature: FeatureId, enabled: bool) -> bool {
      let changed = self.features.set(feature, enabled);
      if changed {
         self.touch();
      }
      changed
   }

   pub const fn set_battery_ttl(&mut self, minutes: Option<u32>) {
      self.battery_ttl = minutes;
   }

   /// Forgets every reading taken over the last connection.
   pub fn reset_readings(&mut self) {
      self.battery = None;
      self.noise_mode = None;
      self.ear_detection = None;
      self.features.clear();
      self.battery_ttl = None;
      self.touch();
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address_str.as_str(),
          "name": self.name.as_str(),
          "state": self.state.to_str(),
          "connected": self.is_connected(),
          "battery_ttl_estimate": self.battery_ttl,
      });

      if let Some(battery) = self.battery {
         info["battery"] = battery.to_json();
      }
      if let Some(mode) = self.noise_mode {
         info["noise_mode"] = json!(mode.to_str());
      }
      if let Some(ear) = self.ear_detection {
         info["ear_detection"] = ear.to_json();
      }

      let features: serde_json::Map<_, _> = self
         .features
         .iter()
         .map(|(k, v)| (k.to_str().to_owned(), json!(v)))
         .collect();
      info["features"] = serde_json::Value::Object(features);

      if let Some(ts) = self.last_update
         && let Ok(since) = ts.duration_since(UNIX_EPOCH)
      {
         info["last_update"] = json!(since.as_secs());
      }
      info
   }
}
