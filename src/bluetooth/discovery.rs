//! Adapter monitoring and accessory discovery.
//!
//! Discovery watches the default BlueZ adapter and tells the registry about
//! the recognised accessories paired with it. Only transitions reach the
//! registry. A paired accessory stays tracked while it is out of range: when
//! Bluetooth drops it the session is disconnected and retries are paused, and
//! when Bluetooth brings it back the session connects again. An accessory is
//! untracked only once BlueZ forgets it. Accessories listed in the config are
//! tracked from startup and never untracked.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::watch,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods::recognition,
   config::Config,
   error::{AirPodsError, Result},
   registry::Registry,
};

/// Interval to poll the connected flag of paired devices
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Delay before looking for an adapter again
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(10);

/// A recognised accessory as BlueZ last showed it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sighting {
   name: SmolStr,
   connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
   /// Manage the accessory, connecting when Bluetooth has it connected.
   Track {
      addr: Address,
      name: SmolStr,
      connect: bool,
   },
   /// Bluetooth dropped the accessory; close our link and stop retrying.
   Pause(Address),
   /// BlueZ forgot the accessory.
   Untrack(Address),
}

impl Change {
   const fn address(&self) -> Address {
      match self {
         Self::Track { addr, .. } | Self::Pause(addr) | Self::Untrack(addr) => *addr,
      }
   }
}

/// Accessories as last reported to the registry.
#[derive(Debug, Default)]
struct Presence {
   seen: HashMap<Address, Sighting>,
   /// Configured accessories; these are paused instead of untracked.
   pinned: HashSet<Address>,
}

impl Presence {
   fn new(pinned: impl IntoIterator<Item = Address>) -> Self {
      Self {
         seen: HashMap::new(),
         pinned: pinned.into_iter().collect(),
      }
   }

   /// Records one sighting, returning the change it implies.
   fn update(&mut self, addr: Address, now: Sighting) -> Option<Change> {
      let change = match self.seen.get(&addr) {
         None => Some(Change::Track {
            addr,
            name: now.name.clone(),
            connect: now.connected,
         }),
         Some(prev) if prev.connected && !now.connected => Some(Change::Pause(addr)),
         Some(prev) if !prev.connected && now.connected => Some(Change::Track {
            addr,
            name: now.name.clone(),
            connect: true,
         }),
         Some(_) => None,
      };
      self.seen.insert(addr, now);
      change
   }

   /// Replaces the whole picture after a scan, returning what changed.
   fn reconcile(&mut self, seen: HashMap<Address, Sighting>) -> Vec<Change> {
      let gone: Vec<Address> = self
         .seen
         .keys()
         .filter(|addr| !seen.contains_key(*addr))
         .copied()
         .collect();
      let mut changes: Vec<Change> = gone
         .into_iter()
         .filter_map(|addr| self.remove(addr))
         .collect();
      for (addr, now) in seen {
         changes.extend(self.update(addr, now));
      }
      changes.sort_by_key(Change::address);
      changes
   }

   /// BlueZ forgot `addr`.
   fn remove(&mut self, addr: Address) -> Option<Change> {
      let prev = self.seen.remove(&addr)?;
      if !self.pinned.contains(&addr) {
         Some(Change::Untrack(addr))
      } else if prev.connected {
         Some(Change::Pause(addr))
      } else {
         None
      }
   }

   /// The adapter went away: every connected accessory is now disconnected.
   fn suspend(&mut self) -> Vec<Change> {
      let mut changes: Vec<Change> = self
         .seen
         .iter_mut()
         .filter(|(_, s)| s.connected)
         .map(|(addr, s)| {
            s.connected = false;
            Change::Pause(*addr)
         })
         .collect();
      changes.sort_by_key(Change::address);
      changes
   }
}

pub struct Discovery {
   config: Arc<Config>,
   registry: Registry,
   available: watch::Sender<bool>,
   presence: Presence,
   reported_unavailable: bool,
}

impl Discovery {
   pub fn new(config: Arc<Config>, registry: Registry, available: watch::Sender<bool>) -> Self {
      let presence = Presence::new(config.known_addresses().map(|(addr, _)| addr));
      Self {
         config,
         registry,
         available,
         presence,
         reported_unavailable: false,
      }
   }

   pub async fn run(mut self) {
      for (addr, name) in self.config.known_addresses() {
         debug!("Tracking configured device {name} ({addr})");
         if let Err(e) = self.registry.track_idle(addr, name.into()).await {
            warn!("Failed to track {addr}: {e}");
         }
      }

      loop {
         match self.open_adapter().await {
            Ok((_session, adapter)) => {
               self.reported_unavailable = false;
               self.available.send_replace(true);
               info!("Using Bluetooth adapter {}", adapter.name());
               if let Err(e) = self.monitor(&adapter).await {
                  warn!("Lost Bluetooth adapter {}: {e}", adapter.name());
               }
               self.available.send_replace(false);
               let changes = self.presence.suspend();
               self.apply(changes).await;
            },
            Err(e) => {
               self.available.send_replace(false);
               if self.reported_unavailable {
                  debug!("Bluetooth adapter still unavailable: {e}");
               } else {
                  error!("Bluetooth adapter unavailable, running without devices: {e}");
                  self.reported_unavailable = true;
               }
            },
         }
         time::sleep(ADAPTER_RECOVERY_DELAY).await;
      }
   }

   async fn open_adapter(&self) -> bluer::Result<(Session, Adapter)> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      if !adapter.is_powered().await? {
         info!("Powering on adapter {}", adapter.name());
         adapter.set_powered(true).await?;
      }
      Ok((session, adapter))
   }

   async fn monitor(&mut self, adapter: &Adapter) -> Result<()> {
      let mut events = adapter.events().await?;
      let mut health = time::interval(HEALTH_CHECK_INTERVAL);
      health.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
            _ = health.tick() => {
               let seen = self.scan(adapter).await?;
               let changes = self.presence.reconcile(seen);
               self.apply(changes).await;
            }
            event = events.next() => match event {
               Some(AdapterEvent::DeviceAdded(addr)) => {
                  debug!("Device added: {addr}");
                  if let Some(sighting) = self.sight(adapter, addr).await {
                     let change = self.presence.update(addr, sighting);
                     self.apply(change).await;
                  }
               },
               Some(AdapterEvent::DeviceRemoved(addr)) => {
                  debug!("Device removed: {addr}");
                  let change = self.presence.remove(addr);
                  self.apply(change).await;
               },
               Some(_) => {},
               None => return Err(AirPodsError::AdapterNotAvailable),
            },
         }
      }
   }

   /// Recognised accessories paired with the adapter.
   async fn scan(&self, adapter: &Adapter) -> bluer::Result<HashMap<Address, Sighting>> {
      let mut seen = HashMap::new();
      for addr in adapter.device_addresses().await? {
         if let Some(sighting) = self.sight(adapter, addr).await {
            seen.insert(addr, sighting);
         }
      }
      Ok(seen)
   }

   async fn sight(&self, adapter: &Adapter, addr: Address) -> Option<Sighting> {
      let device = adapter.device(addr).ok()?;
      let name = if let Some(name) = self.config.is_known_device(addr) {
         SmolStr::new(name)
      } else if recognition::is_device_airpods(&device).await {
         device
            .name()
            .await
            .ok()
            .flatten()
            .map_or_else(|| SmolStr::new(addr.to_string()), SmolStr::from)
      } else {
         return None;
      };
      let connected = device.is_connected().await.unwrap_or(false);
      Some(Sighting { name, connected })
   }

   async fn apply(&self, changes: impl IntoIterator<Item = Change>) {
      for change in changes {
         let res = match change {
            Change::Track {
               addr,
               name,
               connect: true,
            } => {
               info!("Found connected accessory: {name} ({addr})");
               self.registry.track(addr, name).await
            },
            Change::Track {
               addr,
               name,
               connect: false,
            } => {
               debug!("Found paired accessory: {name} ({addr})");
               self.registry.track_idle(addr, name).await
            },
            Change::Pause(addr) => {
               info!("Accessory {addr} is no longer connected");
               self.registry.disconnect(addr).await
            },
            Change::Untrack(addr) => {
               info!("Accessory {addr} was removed");
               self.registry.untrack(addr).await
            },
         };
         if let Err(e) = res {
            debug!("Registry rejected discovery change: {e}");
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn addr(last: u8) -> Address {
      Address::new([0, 0, 0, 0, 0, last])
   }

   fn seen(entries: &[(u8, &str, bool)]) -> HashMap<Address, Sighting> {
      entries
         .iter()
         .map(|(a, n, connected)| {
            (addr(*a), Sighting {
               name: SmolStr::new(n),
               connected: *connected,
            })
         })
         .collect()
   }

   fn track(a: u8, name: &str, connect: bool) -> Change {
      Change::Track {
         addr: addr(a),
         name: SmolStr::new(name),
         connect,
      }
   }

   #[test]
   fn only_transitions_are_reported() {
      let mut presence = Presence::default();
      let changes = presence.reconcile(seen(&[(1, "Pro", true), (2, "Max", false)]));
      assert_eq!(changes, [track(1, "Pro", true), track(2, "Max", false)]);

      assert!(
         presence
            .reconcile(seen(&[(1, "Pro", true), (2, "Max", false)]))
            .is_empty()
      );

      let changes = presence.reconcile(seen(&[(2, "Max", true), (3, "Beats", true)]));
      assert_eq!(changes, [
         Change::Untrack(addr(1)),
         track(2, "Max", true),
         track(3, "Beats", true)
      ]);
   }

   #[test]
   fn out_of_range_pauses_instead_of_forgetting() {
      let mut presence = Presence::default();
      presence.reconcile(seen(&[(1, "Pro", true)]));

      let changes = presence.reconcile(seen(&[(1, "Pro", false)]));
      assert_eq!(changes, [Change::Pause(addr(1))]);
      assert!(presence.reconcile(seen(&[(1, "Pro", false)])).is_empty());

      let changes = presence.reconcile(seen(&[(1, "Pro", true)]));
      assert_eq!(changes, [track(1, "Pro", true)]);
   }

   #[test]
   fn removal_untracks_unless_configured() {
      let mut presence = Presence::new([addr(2)]);
      presence.reconcile(seen(&[(1, "Pro", true), (2, "Max", true)]));

      assert_eq!(presence.remove(addr(1)), Some(Change::Untrack(addr(1))));
      assert_eq!(presence.remove(addr(1)), None);
      assert_eq!(presence.remove(addr(2)), Some(Change::Pause(addr(2))));

      presence.reconcile(seen(&[(2, "Max", false)]));
      assert!(presence.reconcile(HashMap::new()).is_empty());
   }

   #[test]
   fn lost_adapter_pauses_connected_accessories() {
      let mut presence = Presence::default();
      presence.reconcile(seen(&[(1, "Pro", true), (2, "Max", false), (3, "Beats", true)]));

      assert_eq!(presence.suspend(), [Change::Pause(addr(1)), Change::Pause(addr(3))]);
      assert!(presence.suspend().is_empty());

      let changes = presence.reconcile(seen(&[(1, "Pro", true), (2, "Max", false)]));
      assert_eq!(changes, [track(1, "Pro", true), Change::Untrack(addr(3))]);
   }
}
