//! D-Bus interface of the service.
//!
//! Every method answers from the registry: reads come from the latest
//! snapshot, writes are routed to the owning session. Failures surface as
//! `false` or an empty string rather than D-Bus errors.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use bluer::Address;
use log::{debug, info, warn};
use tokio::sync::watch;
use zbus::{
   Connection, fdo, interface,
   object_server::{InterfaceRef, SignalEmitter},
   zvariant,
};

use crate::{
   airpods::protocol::{DeviceCommand, FeatureId, NoiseControlMode},
   config::Settings,
   error::Result,
   registry::{Registry, Snapshot},
};

pub const BUS_NAME: &str = "org.podlink";
pub const OBJECT_PATH: &str = "/org/podlink/manager";

pub struct PodlinkService {
   registry: Registry,
   settings: Arc<Settings>,
   adapter: watch::Receiver<bool>,
}

impl PodlinkService {
   pub const fn new(
      registry: Registry,
      settings: Arc<Settings>,
      adapter: watch::Receiver<bool>,
   ) -> Self {
      Self {
         registry,
         settings,
         adapter,
      }
   }

   async fn route(&self, address: &str, cmd: DeviceCommand) -> bool {
      let Some(addr) = parse_address(address) else {
         return false;
      };
      match self.registry.send_command(addr, cmd).await {
         Ok(()) => true,
         Err(e) => {
            debug!("{address}: Command rejected: {e}");
            false
         },
      }
   }
}

fn parse_address(s: &str) -> Option<Address> {
   Address::from_str(s.trim()).ok()
}

fn param<'p, 'v>(
   params: &'p HashMap<String, zvariant::Value<'v>>,
   key: &str,
) -> fdo::Result<&'p zvariant::Value<'v>> {
   let mut value = params
      .get(key)
      .ok_or_else(|| fdo::Error::InvalidArgs(format!("Missing '{key}' parameter")))?;
   while let zvariant::Value::Value(inner) = value {
      value = &**inner;
   }
   Ok(value)
}

fn str_param<'p>(
   params: &'p HashMap<String, zvariant::Value<'_>>,
   key: &str,
) -> fdo::Result<&'p str> {
   match param(params, key)? {
      zvariant::Value::Str(s) => Ok(s.as_str()),
      other => Err(fdo::Error::InvalidArgs(format!(
         "Invalid '{key}' parameter: expected a string, got {other:?}"
      ))),
   }
}

fn bool_param(params: &HashMap<String, zvariant::Value<'_>>, key: &str) -> fdo::Result<bool> {
   match param(params, key)? {
      zvariant::Value::Bool(b) => Ok(*b),
      other => Err(fdo::Error::InvalidArgs(format!(
         "Invalid '{key}' parameter: expected a boolean, got {other:?}"
      ))),
   }
}

/// Translates a `SendCommand` action and its parameters.
pub fn parse_command(
   action: &str,
   params: &HashMap<String, zvariant::Value<'_>>,
) -> fdo::Result<DeviceCommand> {
   match action {
      "set_noise_mode" => {
         let value = str_param(params, "value")?;
         let mode = NoiseControlMode::from_str(value.trim())
            .map_err(|_| fdo::Error::InvalidArgs(format!("Invalid noise mode: {value}")))?;
         Ok(DeviceCommand::SetNoiseMode(mode))
      },
      "set_feature" => {
         let name = str_param(params, "feature")?;
         let enabled = bool_param(params, "enabled")?;
         let feature = FeatureId::from_str(name.trim())
            .map_err(|_| fdo::Error::InvalidArgs(format!("Unknown feature: {name}")))?;
         Ok(DeviceCommand::SetFeature(feature, enabled))
      },
      "refresh_battery" => Ok(DeviceCommand::RequestBattery),
      _ => Err(fdo::Error::InvalidArgs(format!("Unknown action: {action}"))),
   }
}

#[interface(name = "org.podlink.manager")]
impl PodlinkService {
   async fn get_devices(&self) -> String {
      self.registry.snapshot().to_json().to_string()
   }

   async fn get_device(&self, address: String) -> String {
      parse_address(&address)
         .and_then(|addr| self.registry.device(addr))
         .map(|dev| dev.to_json().to_string())
         .unwrap_or_default()
   }

   async fn send_command(
      &self,
      address: String,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> bool {
      let cmd = match parse_command(&action, &params) {
         Ok(cmd) => cmd,
         Err(e) => {
            warn!("{address}: Rejected {action}: {e}");
            return false;
         },
      };
      let ok = self.route(&address, cmd).await;
      if ok {
         info!("{address}: Sent {action}");
      }
      ok
   }

   async fn passthrough(&self, address: String, packet: String) -> bool {
      match hex::decode(packet.trim()) {
         Ok(bytes) if !bytes.is_empty() => {
            self.route(&address, DeviceCommand::Passthrough(bytes)).await
         },
         Ok(_) => false,
         Err(e) => {
            warn!("{address}: Invalid passthrough packet: {e}");
            false
         },
      }
   }

   async fn connect_device(&self, address: String) -> bool {
      let Some(addr) = parse_address(&address) else {
         return false;
      };
      match self.registry.connect(addr).await {
         Ok(()) => true,
         Err(e) => {
            info!("{address}: Connect refused: {e}");
            false
         },
      }
   }

   async fn disconnect_device(&self, address: String) -> bool {
      let Some(addr) = parse_address(&address) else {
         return false;
      };
      match self.registry.disconnect(addr).await {
         Ok(()) => true,
         Err(e) => {
            info!("{address}: Disconnect refused: {e}");
            false
         },
      }
   }

   async fn set_auto_play_pause(&self, enabled: bool) {
      info!("Auto play/pause {}", if enabled { "enabled" } else { "disabled" });
      self.settings.set_auto_play_pause(enabled);
   }

   async fn get_auto_play_pause(&self) -> bool {
      self.settings.auto_play_pause()
   }

   async fn set_log_level(&self, level: String) -> bool {
      match self.settings.set_log_level(&level) {
         Some(level) => {
            info!("Log level set to {level}");
            true
         },
         None => false,
      }
   }

   async fn get_log_level(&self) -> String {
      self.settings.log_level().to_string().to_ascii_lowercase()
   }

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn noise_control_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      mode: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      ear_detection: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_name_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.registry.snapshot().connected_count()
   }

   #[zbus(property)]
   async fn adapter_available(&self) -> bool {
      *self.adapter.borrow()
   }
}

/// Emits `PropertiesChanged` whenever the snapshot or adapter state moves.
pub async fn spawn_property_watch(
   connection: &Connection,
   mut snapshot: watch::Receiver<Snapshot>,
   mut adapter: watch::Receiver<bool>,
) -> Result<()> {
   let iface: InterfaceRef<PodlinkService> = connection
      .object_server()
      .interface::<_, PodlinkService>(OBJECT_PATH)
      .await?;

   tokio::spawn(async move {
      let mut last_count = snapshot.borrow().connected_count();
      loop {
         tokio::select! {
            changed = snapshot.changed() => {
               if changed.is_err() {
                  break;
               }
               let count = snapshot.borrow_and_update().connected_count();
               let service = iface.get().await;
               let emitter = iface.signal_emitter();
               if let Err(e) = service.devices_changed(emitter).await {
                  warn!("Failed to emit Devices change: {e}");
               }
               if count != last_count {
                  last_count = count;
                  if let Err(e) = service.connected_count_changed(emitter).await {
                     warn!("Failed to emit ConnectedCount change: {e}");
                  }
               }
            }
            changed = adapter.changed() => {
               if changed.is_err() {
                  break;
               }
               adapter.borrow_and_update();
               let service = iface.get().await;
               if let Err(e) = service.adapter_available_changed(iface.signal_emitter()).await {
                  warn!("Failed to emit AdapterAvailable change: {e}");
               }
            }
         }
      }
   });
   Ok(())
}
