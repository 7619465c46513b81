//! podlinkd: AirPods D-Bus service.
//!
//! Keeps an L2CAP control session with every connected AirPods-family
//! accessory, publishes battery, noise control and ear detection state on
//! the session bus, and pauses media when the buds come out.

use std::{env, process, sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{
   signal,
   sync::{Notify, watch},
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

mod airpods;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod media_control;
mod registry;

use crate::{
   airpods::device::Device,
   bluetooth::{discovery::Discovery, transport::L2CapConnector},
   config::{Config, Settings},
   dbus::{PodlinkService, PodlinkServiceSignals},
   error::Result,
   event::{AirPodsEvent, EventBus, EventSender, Fanout},
   media_control::{AutoPlayPause, MprisControl},
   registry::{Registry, RegistryConfig},
};

const USAGE: &str = "\
Usage: podlinkd [OPTIONS]

Options:
  -h, --help       Print this help
  -V, --version    Print version

Configuration is read from $AIRPODS_HOME/airpods-service/config.toml,
falling back to the XDG config directory. RUST_LOG overrides log_filter.";

#[tokio::main]
async fn main() -> Result<()> {
   if let Some(arg) = env::args().nth(1) {
      match arg.as_str() {
         "-V" | "--version" => {
            println!("podlinkd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
         },
         "-h" | "--help" => {
            println!("{USAGE}");
            return Ok(());
         },
         other => {
            eprintln!("podlinkd: unknown argument '{other}'\n\n{USAGE}");
            process::exit(2);
         },
      }
   }

   let config = Config::load()?;
   let (logger, level) = config.logger(env::var("RUST_LOG").ok().as_deref());
   log::set_boxed_logger(Box::new(logger))?;
   log::set_max_level(level);

   info!("Starting podlinkd {}", env!("CARGO_PKG_VERSION"));
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let settings = Arc::new(Settings::new(&config));
   let event_bus = EventProcessor::new();

   let media = Arc::new(MprisControl::new(Connection::session().await?));
   let play_pause = AutoPlayPause::spawn(media, settings.clone(), config.ear_debounce());

   let registry = Registry::spawn(
      RegistryConfig::from_config(&config),
      Arc::new(L2CapConnector::new()),
      Arc::new(Fanout(vec![event_bus.clone() as EventSender, play_pause])),
   );

   let (adapter_tx, adapter_rx) = watch::channel(false);
   let service = PodlinkService::new(registry.clone(), settings, adapter_rx.clone());

   let connection = connection::Builder::session()?
      .name(dbus::BUS_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("D-Bus service started at {}", dbus::BUS_NAME);

   event_bus.spawn_dispatcher(&connection).await?;
   dbus::spawn_property_watch(&connection, registry.subscribe(), adapter_rx).await?;

   tokio::spawn(Discovery::new(Arc::new(config), registry, adapter_tx).run());

   signal::ctrl_c().await?;
   info!("Shutting down podlinkd...");

   Ok(())
}

/// Queues registry events for delivery as D-Bus signals.
struct EventProcessor {
   queue: SegQueue<(Device, AirPodsEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<(Device, AirPodsEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<PodlinkService>,
      (device, event): (Device, AirPodsEvent),
   ) -> zbus::Result<()> {
      let addr = device.address_str().as_str();
      match event {
         AirPodsEvent::DeviceConnected => iface.device_connected(addr).await,
         AirPodsEvent::DeviceDisconnected => iface.device_disconnected(addr).await,
         AirPodsEvent::DeviceError => iface.device_error(addr).await,
         AirPodsEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(addr, &battery.to_json().to_string())
               .await
         },
         AirPodsEvent::NoiseControlChanged(mode) => {
            iface.noise_control_changed(addr, mode.to_str()).await
         },
         AirPodsEvent::EarDetectionChanged(ears) => {
            iface
               .ear_detection_changed(addr, &ears.to_json().to_string())
               .await
         },
         AirPodsEvent::DeviceNameChanged(name) => iface.device_name_changed(addr, &name).await,
      }
   }

   async fn spawn_dispatcher(self: &Arc<Self>, connection: &Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, PodlinkService>(dbus::OBJECT_PATH)
         .await?;
      let this = Arc::clone(self);
      tokio::spawn(async move {
         while let Some(event) = this.recv().await {
            if let Err(e) = this.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });
      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &Device, event: AirPodsEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
