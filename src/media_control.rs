//! Automatic play/pause driven by ear detection.
//!
//! Taking the last earpiece out pauses whatever is playing; putting one back
//! in resumes it, but only if the pause came from here. Ear readings are
//! debounced per device so a bud wiggled in and out settles before anything
//! happens, and the first reading after a connect is only a baseline.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::Address;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   select,
   sync::mpsc,
   time::{self, Instant},
};
use zbus::{Connection, names::OwnedBusName, proxy::CacheProperties};

use crate::{
   airpods::{device::Device, protocol::EarDetectionStatus},
   config::Settings,
   event::{AirPodsEvent, EventBus},
};

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";

/// Something that can pause and resume media playback.
pub trait MediaControl: Send + Sync + 'static {
   /// Pauses everything that is playing; resolves to whether anything was.
   fn pause(&self) -> BoxFuture<'_, bool>;

   /// Resumes exactly what the last successful pause stopped.
   fn resume(&self) -> BoxFuture<'_, ()>;
}

#[zbus::proxy(
   interface = "org.mpris.MediaPlayer2.Player",
   default_path = "/org/mpris/MediaPlayer2"
)]
trait Player {
   fn pause(&self) -> zbus::Result<()>;

   fn play(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn playback_status(&self) -> zbus::Result<String>;
}

/// Session-bus MPRIS players.
pub struct MprisControl {
   conn: Connection,
   paused: Mutex<Vec<OwnedBusName>>,
}

impl MprisControl {
   pub fn new(conn: Connection) -> Self {
      Self {
         conn,
         paused: Mutex::new(Vec::new()),
      }
   }

   async fn player(&self, name: &OwnedBusName) -> zbus::Result<PlayerProxy<'static>> {
      PlayerProxy::builder(&self.conn)
         .destination(name.to_string())?
         .cache_properties(CacheProperties::No)
         .build()
         .await
   }

   /// Local players only; KDE Connect proxies control other machines.
   async fn players(&self) -> zbus::Result<Vec<OwnedBusName>> {
      let dbus = zbus::fdo::DBusProxy::new(&self.conn).await?;
      let names = dbus.list_names().await?;
      Ok(names
         .into_iter()
         .filter(|n| {
            let n = n.as_str();
            n.starts_with(MPRIS_PREFIX) && !n.to_ascii_lowercase().contains("kdeconnect")
         })
         .collect())
   }

   async fn pause_playing(&self) -> zbus::Result<bool> {
      let mut paused = Vec::new();
      for name in self.players().await? {
         let player = match self.player(&name).await {
            Ok(p) => p,
            Err(e) => {
               debug!("Skipping player {name}: {e}");
               continue;
            },
         };
         if player.playback_status().await.ok().as_deref() != Some("Playing") {
            continue;
         }
         match player.pause().await {
            Ok(()) => {
               debug!("Paused {name}");
               paused.push(name);
            },
            Err(e) => warn!("Failed to pause {name}: {e}"),
         }
      }
      let any = !paused.is_empty();
      if any {
         *self.paused.lock() = paused;
      }
      Ok(any)
   }
}

impl MediaControl for MprisControl {
   fn pause(&self) -> BoxFuture<'_, bool> {
      Box::pin(async move {
         self.pause_playing().await.unwrap_or_else(|e| {
            warn!("Failed to query media players: {e}");
            false
         })
      })
   }

   fn resume(&self) -> BoxFuture<'_, ()> {
      Box::pin(async move {
         let players = std::mem::take(&mut *self.paused.lock());
         for name in players {
            let res = match self.player(&name).await {
               Ok(player) => player.play().await,
               Err(e) => Err(e),
            };
            match res {
               Ok(()) => debug!("Resumed {name}"),
               Err(e) => warn!("Failed to resume {name}: {e}"),
            }
         }
      })
   }
}

#[derive(Debug)]
enum EarEvent {
   Update(Address, EarDetectionStatus),
   Gone(Address),
}

/// Handle to the controller task. Feed it through [`EventBus`] or directly.
pub struct AutoPlayPause {
   tx: mpsc::UnboundedSender<EarEvent>,
}

impl AutoPlayPause {
   pub fn spawn(media: Arc<dyn MediaControl>, settings: Arc<Settings>, debounce: Duration) -> Arc<Self> {
      let (tx, rx) = mpsc::unbounded_channel();
      let actor = Controller {
         media,
         settings,
         debounce,
         rx,
         devices: HashMap::new(),
      };
      tokio::spawn(actor.run());
      Arc::new(Self { tx })
   }

   pub fn observe(&self, address: Address, status: EarDetectionStatus) {
      let _ = self.tx.send(EarEvent::Update(address, status));
   }

   /// Drops the device's state, cancelling any pending debounce.
   pub fn forget(&self, address: Address) {
      let _ = self.tx.send(EarEvent::Gone(address));
   }
}

impl EventBus for AutoPlayPause {
   fn emit(&self, device: &Device, event: AirPodsEvent) {
      match event {
         AirPodsEvent::EarDetectionChanged(status) if device.is_connected() => {
            self.observe(device.address(), status);
         },
         AirPodsEvent::DeviceDisconnected => self.forget(device.address()),
         _ => {},
      }
   }
}

#[derive(Debug, Default)]
struct EarTracker {
   /// Last settled "any earpiece in" reading; `None` until the baseline.
   settled: Option<bool>,
   pending: Option<(bool, Instant)>,
   paused_by_us: bool,
}

struct Controller {
   media: Arc<dyn MediaControl>,
   settings: Arc<Settings>,
   debounce: Duration,
   rx: mpsc::UnboundedReceiver<EarEvent>,
   devices: HashMap<Address, EarTracker>,
}

impl Controller {
   async fn run(mut self) {
      loop {
         let next = self
            .devices
            .iter()
            .filter_map(|(addr, t)| t.pending.map(|(_, at)| (*addr, at)))
            .min_by_key(|(_, at)| *at);
         let sleep = async {
            match next {
               Some((_, at)) => time::sleep_until(at).await,
               None => std::future::pending().await,
            }
         };
         select! {
            ev = self.rx.recv() => match ev {
               Some(ev) => self.handle(ev),
               None => break,
            },
            () = sleep => {
               if let Some((addr, _)) = next {
                  self.settle(addr).await;
               }
            },
         }
      }
   }

   fn handle(&mut self, ev: EarEvent) {
      match ev {
         EarEvent::Update(addr, status) => {
            let in_ear = status.any_in_ear();
            let tracker = self.devices.entry(addr).or_default();
            match tracker.settled {
               None => {
                  debug!("{addr}: Ear baseline in_ear={in_ear}");
                  tracker.settled = Some(in_ear);
               },
               Some(settled) if settled == in_ear => tracker.pending = None,
               Some(_) => tracker.pending = Some((in_ear, Instant::now() + self.debounce)),
            }
         },
         EarEvent::Gone(addr) => {
            self.devices.remove(&addr);
         },
      }
   }

   async fn settle(&mut self, addr: Address) {
      let Some(tracker) = self.devices.get_mut(&addr) else {
         return;
      };
      let Some((in_ear, _)) = tracker.pending.take() else {
         return;
      };
      tracker.settled = Some(in_ear);
      if !self.settings.auto_play_pause() {
         tracker.paused_by_us = false;
         return;
      }

      if in_ear {
         if tracker.paused_by_us {
            tracker.paused_by_us = false;
            info!("{addr}: Earpiece back in, resuming playback");
            self.media.resume().await;
         }
      } else {
         tracker.paused_by_us = self.media.pause().await;
         if tracker.paused_by_us {
            info!("{addr}: Both earpieces out, paused playback");
         }
      }
   }
}
