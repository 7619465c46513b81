//! Event handling system for accessory status updates.
//!
//! Sessions describe what changed on their device as an [`AirPodsEvent`];
//! the registry forwards every event, together with the device record it
//! applies to, to whatever [`EventBus`] the service was started with.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::airpods::{
   device::Device,
   protocol::{BatteryInfo, EarDetectionStatus, NoiseControlMode},
};

/// Events that can be emitted by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AirPodsEvent {
   DeviceConnected,
   DeviceDisconnected,
   DeviceError,
   BatteryUpdated(BatteryInfo),
   NoiseControlChanged(NoiseControlMode),
   EarDetectionChanged(EarDetectionStatus),
   DeviceNameChanged(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &Device, event: AirPodsEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Delivers each event to several buses in order.
pub struct Fanout(pub Vec<EventSender>);

impl EventBus for Fanout {
   fn emit(&self, device: &Device, event: AirPodsEvent) {
      if let Some((last, rest)) = self.0.split_last() {
         for bus in rest {
            bus.emit(device, event.clone());
         }
         last.emit(device, event);
      }
   }
}
