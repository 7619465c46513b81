//! Device registry.
//!
//! The registry actor owns one session per tracked accessory and is the only
//! place the address → session map is touched. Every change a session reports
//! is folded into a [`Snapshot`] and published on a `watch` channel, so
//! readers always see a coherent view across all devices. Connection attempts
//! that fail are retried with capped exponential backoff; each pending retry
//! is a timer task tagged with an epoch so a stale timer can never fire a
//! connect after it was cancelled. Sessions are tagged the same way with a
//! generation, so a session that is still winding down after `untrack`
//! cannot touch the slot of a later `track` of the same address.

use std::{collections::HashMap, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   task::JoinHandle,
   time,
};

use crate::{
   airpods::{
      device::Device,
      protocol::DeviceCommand,
      session::{
         self, ReportKind, SessionConfig, SessionHandle, SessionReport, SessionState,
      },
   },
   bluetooth::transport::SharedConnector,
   config::Config,
   error::{AirPodsError, RegistryError, Result},
   event::{AirPodsEvent, EventSender},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;
/// Upper bound of the random delay added to every retry.
const RETRY_JITTER_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
   pub retry_count: u32,
   pub retry_base_delay: Duration,
   pub max_retry_delay: Duration,
   pub session: SessionConfig,
}

impl RegistryConfig {
   pub fn from_config(config: &Config) -> Self {
      Self {
         retry_count: config.connection_retry_count,
         retry_base_delay: config.retry_base_delay(),
         max_retry_delay: config.max_retry_delay(),
         session: SessionConfig {
            handshake_timeout: config.handshake_timeout(),
            ..SessionConfig::default()
         },
      }
   }

   /// `base·2^(attempt-1)`, capped, plus jitter.
   fn retry_delay(&self, attempt: u32) -> Duration {
      let exponent = attempt.saturating_sub(1).min(16);
      let delay = self
         .retry_base_delay
         .saturating_mul(1 << exponent)
         .min(self.max_retry_delay);
      let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
      delay + Duration::from_millis(jitter)
   }
}

impl Default for RegistryConfig {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

/// Aggregated view of every tracked device, ordered by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
   devices: Vec<Device>,
}

impl Snapshot {
   pub fn devices(&self) -> &[Device] {
      &self.devices
   }

   pub fn get(&self, address: Address) -> Option<&Device> {
      self
         .devices
         .binary_search_by_key(&address, Device::address)
         .ok()
         .map(|i| &self.devices[i])
   }

   pub fn connected_count(&self) -> u32 {
      self.devices.iter().filter(|d| d.is_connected()).count() as u32
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::Value::Array(self.devices.iter().map(Device::to_json).collect())
   }
}

#[derive(Debug)]
enum ManagerCommand {
   Track {
      address: Address,
      name: SmolStr,
      connect: bool,
   },
   Untrack(Address),
   Connect(Address, oneshot::Sender<Result<()>>),
   Disconnect(Address, oneshot::Sender<Result<()>>),
   GetSession(Address, oneshot::Sender<Result<SessionHandle>>),
   Retry(Address, u64),
}

/// Handle to the registry actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Registry {
   inbox: mpsc::Sender<ManagerCommand>,
   snapshot: watch::Receiver<Snapshot>,
}

impl Registry {
   pub fn spawn(config: RegistryConfig, connector: SharedConnector, event_tx: EventSender) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
      let (report_tx, report_rx) = mpsc::unbounded_channel();
      let actor = RegistryActor {
         config,
         connector,
         event_tx,
         command_rx,
         loopback_tx: command_tx.downgrade(),
         report_tx,
         report_rx,
         snapshot_tx,
         slots: HashMap::new(),
         next_epoch: 0,
         next_generation: 0,
      };
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         snapshot: snapshot_rx,
      }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<Result<T>>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| RegistryError::Shutdown)?;
      rx.await.map_err(|_| RegistryError::Shutdown)?
   }

   /// Starts managing `address`, connecting to it right away. An address
   /// that is already managed gets automatic connection back.
   pub async fn track(&self, address: Address, name: SmolStr) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::Track {
            address,
            name,
            connect: true,
         })
         .await
         .map_err(|_| RegistryError::Shutdown.into())
   }

   /// Starts managing `address` without connecting. No-op when the
   /// address is already managed.
   pub async fn track_idle(&self, address: Address, name: SmolStr) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::Track {
            address,
            name,
            connect: false,
         })
         .await
         .map_err(|_| RegistryError::Shutdown.into())
   }

   /// Stops managing `address`, closing its link if one is open.
   pub async fn untrack(&self, address: Address) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::Untrack(address))
         .await
         .map_err(|_| RegistryError::Shutdown.into())
   }

   /// Starts a connection attempt.
   pub async fn connect(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Connect(address, tx))
         .await
   }

   /// Disconnects and suppresses automatic reconnection.
   pub async fn disconnect(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Disconnect(address, tx))
         .await
   }

   pub async fn session(&self, address: Address) -> Result<SessionHandle> {
      self
         .request(|tx| ManagerCommand::GetSession(address, tx))
         .await
   }

   /// Routes a command to the session of `address`.
   pub async fn send_command(&self, address: Address, cmd: DeviceCommand) -> Result<()> {
      self.session(address).await?.send(cmd).await
   }

   pub fn snapshot(&self) -> Snapshot {
      self.snapshot.borrow().clone()
   }

   pub fn device(&self, address: Address) -> Option<Device> {
      self.snapshot.borrow().get(address).cloned()
   }

   pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
      self.snapshot.clone()
   }
}

struct PendingRetry {
   epoch: u64,
   timer: JoinHandle<()>,
}

struct SessionSlot {
   handle: SessionHandle,
   /// Reports carrying any other generation come from a replaced session.
   generation: u64,
   device: Device,
   /// A connect was requested and no state report has settled it yet.
   connecting: bool,
   retry_count: u32,
   retry: Option<PendingRetry>,
   auto_reconnect: bool,
}

impl SessionSlot {
   fn cancel_retry(&mut self) {
      if let Some(retry) = self.retry.take() {
         retry.timer.abort();
      }
   }

   fn in_flight(&self) -> bool {
      self.connecting
         || matches!(
            self.device.state(),
            SessionState::Connecting | SessionState::Handshaking
         )
   }
}

struct RegistryActor {
   config: RegistryConfig,
   connector: SharedConnector,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::WeakSender<ManagerCommand>,
   report_tx: session::ReportSender,
   report_rx: mpsc::UnboundedReceiver<SessionReport>,
   snapshot_tx: watch::Sender<Snapshot>,
   slots: HashMap<Address, SessionSlot>,
   next_epoch: u64,
   next_generation: u64,
}

impl RegistryActor {
   async fn run(mut self) {
      info!("Device registry starting up");
      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Device registry shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(report) = self.report_rx.recv() => {
               self.handle_report(report);
            }
         }
      }
      for slot in self.slots.values_mut() {
         slot.cancel_retry();
      }
   }

   fn publish(&self) {
      let mut devices: Vec<Device> = self.slots.values().map(|s| s.device.clone()).collect();
      devices.sort_unstable_by_key(Device::address);
      self.snapshot_tx.send_replace(Snapshot { devices });
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Track {
            address,
            name,
            connect,
         } => self.track(address, name, connect),
         ManagerCommand::Untrack(addr) => self.untrack(addr),
         ManagerCommand::Connect(addr, reply) => {
            let _ = reply.send(self.connect(addr));
         },
         ManagerCommand::Disconnect(addr, reply) => self.disconnect(addr, reply),
         ManagerCommand::GetSession(addr, reply) => {
            let res = self
               .slots
               .get(&addr)
               .map(|s| s.handle.clone())
               .ok_or(AirPodsError::Registry(RegistryError::UnknownDevice(addr)));
            let _ = reply.send(res);
         },
         ManagerCommand::Retry(addr, epoch) => self.retry(addr, epoch),
      }
   }

   fn track(&mut self, addr: Address, name: SmolStr, connect: bool) {
      if let Some(slot) = self.slots.get_mut(&addr) {
         if !connect {
            return;
         }
         if !slot.auto_reconnect {
            debug!("{addr}: Re-reported, re-enabling automatic connection");
         }
         slot.auto_reconnect = true;
         slot.retry_count = 0;
         let _ = self.connect(addr);
         return;
      }

      info!("{addr}: Tracking {name}");
      let generation = self.next_generation;
      self.next_generation += 1;
      let device = Device::new(addr, name);
      let (handle, _task) = session::spawn(
         device.clone(),
         generation,
         self.connector.clone(),
         self.config.session.clone(),
         self.report_tx.clone(),
      );
      self.slots.insert(
         addr,
         SessionSlot {
            device,
            handle,
            generation,
            connecting: false,
            retry_count: 0,
            retry: None,
            auto_reconnect: connect,
         },
      );
      if connect {
         let _ = self.connect(addr);
      }
      self.publish();
   }

   fn untrack(&mut self, addr: Address) {
      let Some(mut slot) = self.slots.remove(&addr) else {
         return;
      };
      info!("{addr}: No longer tracked");
      slot.cancel_retry();
      if slot.device.is_connected() {
         self
            .event_tx
            .emit(&slot.device, AirPodsEvent::DeviceDisconnected);
      }
      // Dropping the last handle ends the session task and closes its link.
      drop(slot);
      self.publish();
   }

   fn connect(&mut self, addr: Address) -> Result<()> {
      let slot = self
         .slots
         .get_mut(&addr)
         .ok_or(RegistryError::UnknownDevice(addr))?;
      if slot.in_flight() {
         return Err(RegistryError::AlreadyConnecting(addr).into());
      }
      if slot.device.state() != SessionState::Disconnected {
         return Ok(());
      }
      slot.cancel_retry();
      slot.auto_reconnect = true;
      slot.handle.connect()?;
      slot.connecting = true;
      Ok(())
   }

   fn disconnect(&mut self, addr: Address, reply: oneshot::Sender<Result<()>>) {
      let Some(slot) = self.slots.get_mut(&addr) else {
         let _ = reply.send(Err(RegistryError::UnknownDevice(addr).into()));
         return;
      };
      slot.auto_reconnect = false;
      slot.retry_count = 0;
      slot.cancel_retry();
      let handle = slot.handle.clone();
      tokio::spawn(async move {
         let _ = reply.send(handle.disconnect().await);
      });
   }

   fn retry(&mut self, addr: Address, epoch: u64) {
      let Some(slot) = self.slots.get_mut(&addr) else {
         return;
      };
      if slot.retry.as_ref().is_none_or(|r| r.epoch != epoch) {
         debug!("{addr}: Ignoring stale retry timer");
         return;
      }
      slot.retry = None;
      if slot.auto_reconnect {
         debug!("{addr}: Retry {} firing", slot.retry_count);
         if let Err(e) = self.connect(addr) {
            warn!("{addr}: Retry could not start: {e}");
         }
      }
   }

   fn schedule_retry(&mut self, addr: Address) {
      let epoch = self.next_epoch;
      self.next_epoch += 1;
      let Some(slot) = self.slots.get_mut(&addr) else {
         return;
      };
      slot.retry_count += 1;
      if slot.retry_count > self.config.retry_count {
         warn!(
            "{addr}: Giving up after {} connection attempts",
            slot.retry_count
         );
         return;
      }
      let delay = self.config.retry_delay(slot.retry_count);
      info!(
         "{addr}: Retrying connection in {delay:?} (attempt {}/{})",
         slot.retry_count, self.config.retry_count
      );
      let loopback = self.loopback_tx.clone();
      let timer = tokio::spawn(async move {
         time::sleep(delay).await;
         if let Some(loopback) = loopback.upgrade() {
            let _ = loopback.send(ManagerCommand::Retry(addr, epoch)).await;
         }
      });
      slot.cancel_retry();
      slot.retry = Some(PendingRetry { epoch, timer });
   }

   fn handle_report(&mut self, report: SessionReport) {
      let SessionReport {
         address,
         generation,
         device,
         kind,
      } = report;
      let Some(slot) = self.slots.get_mut(&address) else {
         debug!("{address}: Report from untracked session");
         return;
      };
      if slot.generation != generation {
         debug!("{address}: Report from replaced session {generation}");
         return;
      }
      let was_connected = slot.device.is_connected();
      slot.device = device;

      match kind {
         ReportKind::State => {
            slot.connecting = false;
            if slot.device.is_connected() {
               slot.retry_count = 0;
               self
                  .event_tx
                  .emit(&slot.device, AirPodsEvent::DeviceConnected);
            }
         },
         ReportKind::Changed(event) => {
            if let Some(event) = event {
               self.event_tx.emit(&slot.device, event);
            }
         },
         ReportKind::Ended(reason) => {
            slot.connecting = false;
            if was_connected {
               self
                  .event_tx
                  .emit(&slot.device, AirPodsEvent::DeviceDisconnected);
            }
            if reason.is_failure() {
               if !was_connected {
                  self.event_tx.emit(&slot.device, AirPodsEvent::DeviceError);
               }
               if was_connected {
                  slot.retry_count = 0;
               }
               if slot.auto_reconnect {
                  self.schedule_retry(address);
               }
            } else if slot.auto_reconnect {
               debug!("{address}: Re-enabled while disconnecting, connecting again");
               let _ = self.connect(address);
            } else {
               debug!("{address}: Disconnect complete");
            }
         },
      }
      self.publish();
   }
}
