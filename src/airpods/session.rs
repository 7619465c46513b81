//! Per-accessory connection state machine.
//!
//! Every tracked address gets one long-lived session task. The task owns the
//! [`Device`] record, the transport [`Link`] while one is open, and the
//! decoder buffer. Callers talk to it through a [`SessionHandle`]; the task
//! reports every state change and every reading back to the registry as a
//! [`SessionReport`].

use std::time::Duration;

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   airpods::{
      battery::BatteryTracker,
      codec::{Decoder, Message, Outbound, encode},
      device::Device,
      protocol::DeviceCommand,
   },
   bluetooth::{
      l2cap::{self, L2CapSender, Link},
      transport::SharedConnector,
   },
   error::{AirPodsError, ProtocolError, Result, TransportError},
   event::AirPodsEvent,
};

/// Gaps between notification re-requests while no battery report has arrived.
const NOTIFY_RETRY_SCHEDULE: &[Duration] = &[
   Duration::from_secs(2),
   Duration::from_secs(3),
   Duration::from_secs(5),
   Duration::from_secs(10),
];

/// Connection lifecycle of one accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
   Disconnected,
   Connecting,
   Handshaking,
   Connected,
   Disconnecting,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Illegal session transition {from} -> {to}")]
pub struct IllegalTransition {
   pub from: SessionState,
   pub to: SessionState,
}

impl SessionState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   pub const fn can_advance(self, to: Self) -> bool {
      use SessionState::{Connected, Connecting, Disconnected, Disconnecting, Handshaking};
      matches!(
         (self, to),
         (Disconnected, Connecting)
            | (Connecting, Handshaking | Disconnected)
            | (Handshaking, Connected | Disconnected)
            | (Connected, Disconnecting | Disconnected)
            | (Disconnecting, Disconnected)
      )
   }

   pub const fn advance(self, to: Self) -> std::result::Result<Self, IllegalTransition> {
      if self.can_advance(to) {
         Ok(to)
      } else {
         Err(IllegalTransition { from: self, to })
      }
   }
}

/// Why a session returned to [`SessionState::Disconnected`].
#[derive(Debug)]
pub enum EndReason {
   /// The caller asked for the disconnect.
   Requested,
   /// The transport could not be opened.
   ConnectFailed(TransportError),
   /// The link opened but the handshake did not complete.
   HandshakeFailed(AirPodsError),
   /// An established link went away.
   Lost(TransportError),
}

impl EndReason {
   pub const fn is_failure(&self) -> bool {
      !matches!(self, Self::Requested)
   }
}

#[derive(Debug)]
pub enum ReportKind {
   /// The state machine moved.
   State,
   /// A reading changed while connected.
   Changed(Option<AirPodsEvent>),
   /// The session is back in `Disconnected`.
   Ended(EndReason),
}

/// A session telling the registry about its device.
#[derive(Debug)]
pub struct SessionReport {
   pub address: Address,
   /// Which spawn of the session for `address` sent this.
   pub generation: u64,
   pub device: Device,
   pub kind: ReportKind,
}

pub type ReportSender = mpsc::UnboundedSender<SessionReport>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
   pub connect_timeout: Duration,
   pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
   fn default() -> Self {
      Self {
         connect_timeout: l2cap::CONNECT_TIMEOUT,
         handshake_timeout: Duration::from_secs(5),
      }
   }
}

#[derive(Debug)]
enum SessionRequest {
   Connect,
   Disconnect {
      reply: oneshot::Sender<()>,
   },
   Command {
      cmd: DeviceCommand,
      reply: oneshot::Sender<Result<()>>,
   },
}

/// Cloneable request channel into one session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
   tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
   /// Asks the session to start a connection attempt. Ignored unless the
   /// session is currently disconnected.
   pub fn connect(&self) -> Result<()> {
      match self.tx.try_send(SessionRequest::Connect) {
         Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
         Err(mpsc::error::TrySendError::Closed(_)) => Err(AirPodsError::SessionClosed),
      }
   }

   /// Disconnects, waiting until the link is closed.
   pub async fn disconnect(&self) -> Result<()> {
      let (reply, rx) = oneshot::channel();
      self
         .tx
         .send(SessionRequest::Disconnect { reply })
         .await
         .map_err(|_| AirPodsError::SessionClosed)?;
      rx.await.map_err(|_| AirPodsError::SessionClosed)
   }

   /// Sends a command to the accessory.
   pub async fn send(&self, cmd: DeviceCommand) -> Result<()> {
      let (reply, rx) = oneshot::channel();
      self
         .tx
         .send(SessionRequest::Command { cmd, reply })
         .await
         .map_err(|_| AirPodsError::SessionClosed)?;
      rx.await.map_err(|_| AirPodsError::SessionClosed)?
   }
}

/// Starts the session task for `device`. The task ends once every handle is
/// dropped, closing the link first if one is open. Every report it sends
/// carries `generation`.
pub fn spawn(
   device: Device,
   generation: u64,
   connector: SharedConnector,
   config: SessionConfig,
   reports: ReportSender,
) -> (SessionHandle, JoinHandle<()>) {
   let (tx, rx) = mpsc::channel(32);
   let handle = SessionHandle { tx };
   let session = Session {
      device,
      generation,
      connector,
      config,
      reports,
      rx,
      decoder: Decoder::new(),
      battery: BatteryTracker::new(),
   };
   (handle, tokio::spawn(session.run()))
}

/// Answers requests while no usable link exists. Resolves when the caller
/// asks for a disconnect (with its reply slot) or drops every handle.
async fn until_abort(rx: &mut mpsc::Receiver<SessionRequest>) -> Option<oneshot::Sender<()>> {
   loop {
      match rx.recv().await {
         Some(SessionRequest::Connect) => {},
         Some(SessionRequest::Command { reply, .. }) => {
            let _ = reply.send(Err(AirPodsError::NotConnected));
         },
         Some(SessionRequest::Disconnect { reply }) => return Some(reply),
         None => return None,
      }
   }
}

/// Sends the handshake and waits a bounded time for the reply.
async fn handshake(link: &mut Link, decoder: &mut Decoder, limit: Duration) -> Result<()> {
   link.sender().send(&encode(&Outbound::Handshake)).await?;
   time::timeout(limit, await_handshake(link, decoder))
      .await
      .map_err(|_| ProtocolError::HandshakeTimeout)?
}

/// Reads until the handshake reply shows up.
async fn await_handshake(link: &mut Link, decoder: &mut Decoder) -> Result<()> {
   loop {
      let chunk = link.recv().await?;
      decoder.push(&chunk);
      loop {
         match decoder.next_message() {
            Ok(Some(Message::Handshake)) => return Ok(()),
            Ok(Some(msg)) => debug!("Ignoring {msg:?} before handshake"),
            Ok(None) => break,
            Err(e) => debug!("Ignoring bad frame before handshake: {e}"),
         }
      }
      if let Err(e) = decoder.end_of_read() {
         debug!("Ignoring bad frame before handshake: {e}");
      }
   }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
   match deadline {
      Some(deadline) => time::sleep_until(deadline).await,
      None => std::future::pending().await,
   }
}

/// Outcome of one connection attempt.
enum Attempt {
   Ended(EndReason, Option<oneshot::Sender<()>>),
   /// Every handle was dropped.
   Orphaned,
}

struct Session {
   device: Device,
   generation: u64,
   connector: SharedConnector,
   config: SessionConfig,
   reports: ReportSender,
   rx: mpsc::Receiver<SessionRequest>,
   decoder: Decoder,
   battery: BatteryTracker,
}

impl Session {
   async fn run(mut self) {
      let address = self.device.address();
      while let Some(req) = self.rx.recv().await {
         match req {
            SessionRequest::Connect => match self.connect_and_serve().await {
               Attempt::Ended(reason, reply) => {
                  self.finish(reason);
                  if let Some(reply) = reply {
                     let _ = reply.send(());
                  }
               },
               Attempt::Orphaned => {
                  self.finish(EndReason::Requested);
                  break;
               },
            },
            SessionRequest::Disconnect { reply } => {
               let _ = reply.send(());
            },
            SessionRequest::Command { reply, .. } => {
               let _ = reply.send(Err(AirPodsError::NotConnected));
            },
         }
      }
      debug!("{address}: Session task finished");
   }

   fn report(&self, kind: ReportKind) {
      let _ = self.reports.send(SessionReport {
         address: self.device.address(),
         generation: self.generation,
         device: self.device.clone(),
         kind,
      });
   }

   fn changed(&self, event: impl Into<Option<AirPodsEvent>>) {
      self.report(ReportKind::Changed(event.into()));
   }

   fn transition(&mut self, to: SessionState) {
      match self.device.state().advance(to) {
         Ok(state) => {
            self.device.set_state(state);
            if state != SessionState::Disconnected {
               self.report(ReportKind::State);
            }
         },
         Err(e) => warn!("{}: {e}", self.device.address()),
      }
   }

   /// Drops back to `Disconnected` and forgets the readings of this link.
   fn finish(&mut self, reason: EndReason) {
      let address = self.device.address();
      match &reason {
         EndReason::Requested => info!("{address}: Disconnected"),
         EndReason::ConnectFailed(e) => warn!("{address}: Connection failed: {e}"),
         EndReason::HandshakeFailed(e) => warn!("{address}: Handshake failed: {e}"),
         EndReason::Lost(e) => warn!("{address}: Connection lost: {e}"),
      }
      self.transition(SessionState::Disconnected);
      self.device.reset_readings();
      self.battery.reset();
      self.decoder.reset();
      self.report(ReportKind::Ended(reason));
   }

   async fn connect_and_serve(&mut self) -> Attempt {
      let address = self.device.address();
      info!("{address}: Connecting");
      self.transition(SessionState::Connecting);

      let open = time::timeout(self.config.connect_timeout, self.connector.open(address));
      let opened = tokio::select! {
         res = open => res.unwrap_or(Err(TransportError::Timeout)),
         abort = until_abort(&mut self.rx) => return self.aborted(abort),
      };
      let mut link = match opened {
         Ok(link) => link,
         Err(e) => return Attempt::Ended(EndReason::ConnectFailed(e), None),
      };

      self.transition(SessionState::Handshaking);
      self.decoder.reset();
      let exchange = handshake(&mut link, &mut self.decoder, self.config.handshake_timeout);
      let exchanged = tokio::select! {
         res = exchange => res,
         abort = until_abort(&mut self.rx) => return self.aborted(abort),
      };
      if let Err(e) = exchanged {
         return Attempt::Ended(EndReason::HandshakeFailed(e), None);
      }

      self.transition(SessionState::Connected);
      info!("{address}: Handshake complete");
      self.serve(link).await
   }

   fn aborted(&self, abort: Option<oneshot::Sender<()>>) -> Attempt {
      match abort {
         Some(reply) => Attempt::Ended(EndReason::Requested, Some(reply)),
         None => Attempt::Orphaned,
      }
   }

   async fn serve(&mut self, mut link: Link) -> Attempt {
      let sender = link.sender().clone();
      for pkt in [Outbound::NegotiateFeatures, Outbound::RequestNotifications] {
         if let Err(e) = sender.send(&encode(&pkt)).await {
            return Attempt::Ended(EndReason::Lost(e), None);
         }
      }

      let mut retries = NOTIFY_RETRY_SCHEDULE.iter();
      let mut next_notify = retries.next().map(|d| Instant::now() + *d);

      let outcome = loop {
         if self.device.battery().is_some() {
            next_notify = None;
         }
         tokio::select! {
            chunk = link.recv() => match chunk {
               Ok(bytes) => self.ingest(&bytes),
               Err(e) => break Attempt::Ended(EndReason::Lost(e), None),
            },
            req = self.rx.recv() => match req {
               Some(SessionRequest::Command { cmd, reply }) => {
                  let _ = reply.send(self.execute(&sender, cmd).await);
               },
               Some(SessionRequest::Connect) => {},
               Some(SessionRequest::Disconnect { reply }) => {
                  break Attempt::Ended(EndReason::Requested, Some(reply));
               },
               None => break Attempt::Orphaned,
            },
            () = sleep_until_opt(next_notify) => {
               warn!(
                  "{}: No battery status yet, re-requesting notifications",
                  self.device.address()
               );
               let _ = sender.send(&encode(&Outbound::RequestNotifications)).await;
               next_notify = retries.next().map(|d| Instant::now() + *d);
            },
         }
      };

      if matches!(
         outcome,
         Attempt::Ended(EndReason::Requested, _) | Attempt::Orphaned
      ) {
         self.transition(SessionState::Disconnecting);
         sender.flush().await;
      }
      drop(link);
      outcome
   }

   async fn execute(&mut self, sender: &L2CapSender, cmd: DeviceCommand) -> Result<()> {
      let packet = encode(&Outbound::from(cmd.clone()));
      sender.send(&packet).await?;
      match cmd {
         DeviceCommand::SetNoiseMode(mode) => {
            if self.device.update_noise_mode(mode).is_updated() {
               self.changed(AirPodsEvent::NoiseControlChanged(mode));
            }
         },
         DeviceCommand::SetFeature(feature, enabled) => {
            if self.device.set_feature(feature, enabled) {
               self.changed(None);
            }
         },
         DeviceCommand::RequestBattery | DeviceCommand::Passthrough(_) => {},
      }
      Ok(())
   }

   fn ingest(&mut self, bytes: &[u8]) {
      self.decoder.push(bytes);
      loop {
         match self.decoder.next_message() {
            Ok(Some(msg)) => self.apply(msg),
            Ok(None) => break,
            Err(e) => warn!("{}: Dropped frame: {e}", self.device.address()),
         }
      }
      if let Err(e) = self.decoder.end_of_read() {
         warn!("{}: Dropped frame: {e}", self.device.address());
      }
   }

   fn apply(&mut self, msg: Message) {
      let address = self.device.address();
      match msg {
         Message::BatteryStatus(info) => {
            debug!("{address}: Battery {info}");
            let now = std::time::Instant::now();
            self.battery.observe(&info, now);
            if self.device.update_battery(info).is_updated() {
               let ttl = self.battery.estimate(&info, now);
               self.device.set_battery_ttl(ttl);
               self.changed(AirPodsEvent::BatteryUpdated(info));
            }
         },
         Message::NoiseModeStatus(mode) => {
            debug!("{address}: Noise mode {mode}");
            if self.device.update_noise_mode(mode).is_updated() {
               self.changed(AirPodsEvent::NoiseControlChanged(mode));
            }
         },
         Message::EarDetection(status) => {
            debug!(
               "{address}: Ear detection L:{} R:{}",
               status.left_in_ear, status.right_in_ear
            );
            if self.device.update_ear_detection(status).is_updated() {
               self.changed(AirPodsEvent::EarDetectionChanged(status));
            }
         },
         Message::FeatureStatus { feature, enabled } => {
            debug!("{address}: Feature {feature} enabled={enabled}");
            if self.device.set_feature(feature, enabled) {
               self.changed(None);
            }
         },
         Message::Metadata { name: Some(name) } => {
            if self.device.update_name(name.clone()).is_updated() {
               info!("{address}: Device name is now {name}");
               self.changed(AirPodsEvent::DeviceNameChanged(name));
            }
         },
         Message::Metadata { name: None } => debug!("{address}: Metadata without a name"),
         Message::Handshake => debug!("{address}: Duplicate handshake reply"),
         Message::FeatureAck => debug!("{address}: Features acknowledged"),
         Message::Unknown { opcode } => {
            debug!("{address}: {}", ProtocolError::UnsupportedOpcode(opcode));
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::*;
   use crate::{
      airpods::protocol::{
         EarDetectionStatus, NoiseControlMode, PKT_HANDSHAKE, PKT_REQUEST_NOTIFY,
         PKT_SET_FEATURES,
      },
      bluetooth::{
         l2cap::Peer,
         transport::mock::{Failure, MockConnector, accept_handshake},
      },
   };

   const ADDR: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
   const BATTERY: &[u8] = &[
      0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x03, 0x04, 0x01, 0x50, 0x02, 0x01, 0x02, 0x01, 0x4c,
      0x02, 0x01, 0x08, 0x01, 0x3c, 0x01, 0x01,
   ];
   const NOISE_ANC: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x02, 0x00, 0x00, 0x00];

   struct Harness {
      handle: SessionHandle,
      reports: mpsc::UnboundedReceiver<SessionReport>,
      connector: Arc<MockConnector>,
      peers: mpsc::UnboundedReceiver<(Address, Peer)>,
   }

   fn harness() -> Harness {
      let (connector, peers) = MockConnector::new();
      let (tx, reports) = mpsc::unbounded_channel();
      let (handle, _task) = spawn(
         Device::new(Address::new(ADDR), "AirPods Pro"),
         7,
         connector.clone(),
         SessionConfig::default(),
         tx,
      );
      Harness {
         handle,
         reports,
         connector,
         peers,
      }
   }

   impl Harness {
      async fn report(&mut self) -> SessionReport {
         time::timeout(Duration::from_secs(60), self.reports.recv())
            .await
            .expect("no report")
            .expect("session gone")
      }

      async fn until_state(&mut self, state: SessionState) -> SessionReport {
         loop {
            let report = self.report().await;
            if report.device.state() == state {
               return report;
            }
         }
      }

      async fn until_event(&mut self) -> (Device, AirPodsEvent) {
         loop {
            let report = self.report().await;
            if let ReportKind::Changed(Some(event)) = report.kind {
               return (report.device, event);
            }
         }
      }

      async fn until_ended(&mut self) -> (Device, EndReason) {
         loop {
            let report = self.report().await;
            if let ReportKind::Ended(reason) = report.kind {
               return (report.device, reason);
            }
         }
      }

      /// Connects and plays the accessory through the handshake.
      async fn connected(&mut self) -> Peer {
         self.handle.connect().unwrap();
         let (_, mut peer) = self.peers.recv().await.unwrap();
         accept_handshake(&mut peer).await;
         self.until_state(SessionState::Connected).await;
         peer
      }
   }

   #[test]
   fn transitions_follow_the_lifecycle() {
      use SessionState::*;
      assert!(Disconnected.can_advance(Connecting));
      assert!(Connecting.can_advance(Handshaking));
      assert!(Handshaking.can_advance(Connected));
      assert!(Connected.can_advance(Disconnecting));
      assert!(Disconnecting.can_advance(Disconnected));
      assert_eq!(
         Connecting.advance(Connected),
         Err(IllegalTransition {
            from: Connecting,
            to: Connected
         })
      );
      assert!(Disconnected.advance(Connected).is_err());
      assert_eq!(Handshaking.to_str(), "handshaking");
   }

   #[tokio::test]
   async fn handshake_then_readings_update_the_device() {
      let mut h = harness();
      let mut peer = h.connected().await;

      assert_eq!(peer.written().await.unwrap().as_slice(), PKT_SET_FEATURES);
      assert_eq!(peer.written().await.unwrap().as_slice(), PKT_REQUEST_NOTIFY);

      peer.deliver(BATTERY).await;
      let (device, event) = h.until_event().await;
      assert!(matches!(event, AirPodsEvent::BatteryUpdated(_)));
      assert!(device.is_connected());
      let battery = device.battery().unwrap();
      assert_eq!(battery.left.map(|s| s.level.get()), Some(80));
      assert_eq!(battery.right.map(|s| s.level.get()), Some(76));
      assert_eq!(battery.case.map(|s| s.level.get()), Some(60));

      peer.deliver(NOISE_ANC).await;
      let (device, event) = h.until_event().await;
      assert_eq!(
         event,
         AirPodsEvent::NoiseControlChanged(NoiseControlMode::Anc)
      );
      assert_eq!(device.to_json()["noise_mode"], "anc");
   }

   #[tokio::test]
   async fn handshake_starts_the_conversation() {
      let mut h = harness();
      h.handle.connect().unwrap();
      let report = h.until_state(SessionState::Connecting).await;
      assert_eq!(report.address, Address::new(ADDR));
      assert_eq!(report.generation, 7);
      let (_, mut peer) = h.peers.recv().await.unwrap();
      assert_eq!(peer.written().await.unwrap().as_slice(), PKT_HANDSHAKE);
      h.until_state(SessionState::Handshaking).await;
   }

   #[tokio::test(start_paused = true)]
   async fn silent_accessory_times_out_the_handshake() {
      let mut h = harness();
      h.handle.connect().unwrap();
      let (_, _peer) = h.peers.recv().await.unwrap();

      let (device, reason) = h.until_ended().await;
      assert_eq!(device.state(), SessionState::Disconnected);
      assert!(matches!(
         reason,
         EndReason::HandshakeFailed(AirPodsError::Protocol(ProtocolError::HandshakeTimeout))
      ));
   }

   #[tokio::test]
   async fn unreachable_device_ends_the_attempt() {
      let mut h = harness();
      h.connector.fail_next(Address::new(ADDR), Failure::Unreachable, 1);
      h.handle.connect().unwrap();
      let (device, reason) = h.until_ended().await;
      assert!(!device.is_connected());
      assert!(matches!(
         reason,
         EndReason::ConnectFailed(TransportError::Unreachable(_))
      ));
   }

   #[tokio::test]
   async fn commands_need_a_connection() {
      let h = harness();
      let res = h
         .handle
         .send(DeviceCommand::SetNoiseMode(NoiseControlMode::Anc))
         .await;
      assert!(matches!(res, Err(AirPodsError::NotConnected)));
   }

   #[tokio::test]
   async fn commands_reach_the_accessory() {
      let mut h = harness();
      let mut peer = h.connected().await;
      peer.written().await;
      peer.written().await;

      h.handle
         .send(DeviceCommand::SetNoiseMode(NoiseControlMode::Transparency))
         .await
         .unwrap();
      assert_eq!(
         peer.written().await.unwrap().as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x03, 0x00, 0x00, 0x00]
      );
      let (device, _) = h.until_event().await;
      assert_eq!(device.noise_mode(), Some(NoiseControlMode::Transparency));
   }

   #[tokio::test]
   async fn disconnect_resets_readings() {
      let mut h = harness();
      let peer = h.connected().await;
      peer.deliver(BATTERY).await;
      peer.deliver(NOISE_ANC).await;
      h.until_event().await;
      h.until_event().await;

      h.handle.disconnect().await.unwrap();
      let (device, reason) = h.until_ended().await;
      assert!(matches!(reason, EndReason::Requested));
      assert!(!device.is_connected());
      assert!(device.battery().is_none());
      assert!(device.noise_mode().is_none());
      assert_eq!(device.to_json()["connected"], false);
   }

   #[tokio::test]
   async fn disconnect_passes_through_disconnecting() {
      let mut h = harness();
      let _peer = h.connected().await;
      h.handle.disconnect().await.unwrap();
      h.until_state(SessionState::Disconnecting).await;
      h.until_state(SessionState::Disconnected).await;
   }

   #[tokio::test]
   async fn peer_hang_up_is_reported_as_lost() {
      let mut h = harness();
      let peer = h.connected().await;
      peer.hang_up().await;
      let (device, reason) = h.until_ended().await;
      assert!(matches!(
         reason,
         EndReason::Lost(TransportError::PeerClosed)
      ));
      assert!(device.ear_detection().is_none());
   }

   #[tokio::test]
   async fn corrupt_frames_do_not_end_the_session() {
      let mut h = harness();
      let peer = h.connected().await;
      peer.deliver(&[0xde, 0xad, 0xbe, 0xef]).await;
      peer.deliver(&[0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x01, 0x00]).await;
      let (device, event) = h.until_event().await;
      assert_eq!(
         event,
         AirPodsEvent::EarDetectionChanged(EarDetectionStatus::new(false, true))
      );
      assert!(device.is_connected());
   }

   #[tokio::test]
   async fn header_only_packet_is_dropped_on_its_own() {
      let mut h = harness();
      let peer = h.connected().await;
      peer.deliver(&[0x04, 0x00, 0x04, 0x00]).await;
      peer.deliver(&[0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x00, 0x00]).await;
      let (device, event) = h.until_event().await;
      assert_eq!(
         event,
         AirPodsEvent::EarDetectionChanged(EarDetectionStatus::new(true, true))
      );
      assert!(device.is_connected());
   }

   #[tokio::test(start_paused = true)]
   async fn notifications_are_re_requested_until_battery_arrives() {
      let mut h = harness();
      let mut peer = h.connected().await;
      assert_eq!(peer.written().await.unwrap().as_slice(), PKT_SET_FEATURES);
      assert_eq!(peer.written().await.unwrap().as_slice(), PKT_REQUEST_NOTIFY);
      // Nothing answered; the first retry fires after two seconds.
      assert_eq!(peer.written().await.unwrap().as_slice(), PKT_REQUEST_NOTIFY);
   }

   #[tokio::test]
   async fn dropping_every_handle_closes_the_link() {
      let mut h = harness();
      let mut peer = h.connected().await;
      let Harness { handle, mut reports, .. } = h;
      drop(handle);
      loop {
         let report = reports.recv().await.unwrap();
         if matches!(report.kind, ReportKind::Ended(EndReason::Requested)) {
            break;
         }
      }
      while peer.written().await.is_some() {}
   }
}
