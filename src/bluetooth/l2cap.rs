//! L2CAP socket transport for accessory communication.
//!
//! A connected channel is represented by a [`Link`]: a receiver half fed by
//! a reader task and a cloneable sender half feeding a writer task. The
//! channel is always opened in Enhanced Retransmission Mode; if the kernel or
//! the peer refuses that mode the open fails instead of degrading.

use std::{io, mem, os::fd::AsRawFd, sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::TransportError;

pub type Packet = SmallVec<[u8; 32]>;

/// PSM (Protocol Service Multiplexer) for the accessory control channel
pub const PSM_CONTROL: u16 = 0x1001;
/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection attempts
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// <bluetooth/l2cap.h>
const SOL_L2CAP: libc::c_int = 6;
const L2CAP_OPTIONS: libc::c_int = 0x01;
const L2CAP_MODE_ERTM: u8 = 0x03;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct L2capOptions {
   omtu: u16,
   imtu: u16,
   flush_to: u16,
   mode: u8,
   fcs: u8,
   max_tx: u8,
   txwin_size: u16,
}

fn read_options(fd: libc::c_int) -> io::Result<L2capOptions> {
   let mut opts = L2capOptions::default();
   let mut len = mem::size_of::<L2capOptions>() as libc::socklen_t;
   // SAFETY: `opts` is a live repr(C) struct matching `struct l2cap_options`
   // and `len` holds its exact size.
   let rc = unsafe {
      libc::getsockopt(
         fd,
         SOL_L2CAP,
         L2CAP_OPTIONS,
         (&raw mut opts).cast(),
         &raw mut len,
      )
   };
   if rc < 0 {
      return Err(io::Error::last_os_error());
   }
   Ok(opts)
}

fn write_options(fd: libc::c_int, opts: &L2capOptions) -> io::Result<()> {
   // SAFETY: `opts` points to a repr(C) `struct l2cap_options` of the given size.
   let rc = unsafe {
      libc::setsockopt(
         fd,
         SOL_L2CAP,
         L2CAP_OPTIONS,
         (&raw const *opts).cast(),
         mem::size_of::<L2capOptions>() as libc::socklen_t,
      )
   };
   if rc < 0 {
      return Err(io::Error::last_os_error());
   }
   Ok(())
}

/// Requests ERTM on an unconnected socket.
fn request_ertm(fd: libc::c_int) -> Result<(), TransportError> {
   let mut opts = read_options(fd).map_err(|e| {
      TransportError::ModeUnavailable(format!("cannot read L2CAP options: {e}"))
   })?;
   opts.mode = L2CAP_MODE_ERTM;
   write_options(fd, &opts)
      .map_err(|e| TransportError::ModeUnavailable(format!("kernel refused ERTM: {e}")))
}

/// Checks that the connected channel actually negotiated ERTM.
fn verify_ertm(fd: libc::c_int) -> Result<(), TransportError> {
   let opts = read_options(fd).map_err(|e| {
      TransportError::ModeUnavailable(format!("cannot read L2CAP options: {e}"))
   })?;
   if opts.mode != L2CAP_MODE_ERTM {
      return Err(TransportError::ModeUnavailable(format!(
         "channel negotiated mode 0x{:02x}",
         opts.mode
      )));
   }
   Ok(())
}

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<(), TransportError>>,
   },
   Flush {
      then: oneshot::Sender<()>,
   },
}

/// Receiver half of an L2CAP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet, TransportError>>,
}

impl L2CapReceiver {
   /// Waits for the next chunk of bytes from the accessory.
   pub async fn recv(&mut self) -> Result<Packet, TransportError> {
      self.rx.recv().await.unwrap_or(Err(TransportError::PeerClosed))
   }
}

/// Sender half of an L2CAP connection.
///
/// This type is cheaply cloneable. Writes are serialized by the writer task,
/// so concurrent callers queue behind each other for this link only.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
}

fn broken_pipe() -> TransportError {
   TransportError::WriteError(io::Error::from(io::ErrorKind::BrokenPipe))
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
      if !self.is_connected() {
         return Err(broken_pipe());
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| broken_pipe())?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| TransportError::Timeout)?
         .map_err(|_| broken_pipe())?
   }

   /// Resolves once every write queued before this call has completed.
   pub async fn flush(&self) {
      let (tx, rx) = oneshot::channel();
      if self.tx.send(Command::Flush { then: tx }).await.is_ok() {
         let _ = time::timeout(WRITE_TIMEOUT, rx).await;
      }
   }
}

/// One open channel to one accessory.
///
/// Dropping the link aborts its reader and writer tasks, which closes the
/// underlying socket.
#[derive(Debug)]
pub struct Link {
   receiver: L2CapReceiver,
   sender: L2CapSender,
   tasks: JoinSet<()>,
}

impl Link {
   pub async fn recv(&mut self) -> Result<Packet, TransportError> {
      self.receiver.recv().await
   }

   pub const fn sender(&self) -> &L2CapSender {
      &self.sender
   }
}

impl Drop for Link {
   fn drop(&mut self) {
      self.tasks.abort_all();
   }
}

/// Opens an ERTM L2CAP channel to `address`.
pub async fn connect(address: Address, psm: u16) -> Result<Link, TransportError> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet().map_err(TransportError::from_open)?;
   request_ertm(socket.as_raw_fd())?;

   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm:#06x}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| TransportError::Timeout)?
      .map_err(TransportError::from_open)?;
   verify_ertm(seq_packet.as_raw_fd())?;

   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);

   let seq_packet = Arc::new(seq_packet);
   let mut tasks = JoinSet::new();
   tasks.spawn(recv_thread(address, in_tx, seq_packet.clone()));
   tasks.spawn(send_thread(address, cmd_rx, seq_packet));

   Ok(Link {
      receiver: L2CapReceiver { rx: in_rx },
      sender: L2CapSender { tx: cmd_tx },
      tasks,
   })
}

async fn recv_thread(
   adr: Address,
   tx: mpsc::Sender<Result<Packet, TransportError>>,
   sp: Arc<SeqPacket>,
) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      let n = match sp.recv(&mut stack).await {
         Ok(0) => {
            warn!("{adr}: Connection closed by peer");
            0
         },
         Ok(n) => n,
         Err(e) => {
            warn!("{adr}: Receive failed: {e}");
            0
         },
      };
      if n == 0 {
         let _ = tx.send(Err(TransportError::PeerClosed)).await;
         return;
      }
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      if tx.send(Ok(Packet::from_slice(recvd))).await.is_err() {
         return;
      }
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("{adr}: Failed to send data: {e}");
               let _ = then.send(Err(TransportError::WriteError(e)));
            } else {
               let _ = then.send(Ok(()));
            }
         },
         Command::Flush { then } => {
            let _ = then.send(());
         },
      }
   }
   debug!("{adr}: Writer shut down");
}

/// The accessory end of an in-memory [`Link`].
#[cfg(test)]
pub struct Peer {
   inbound: mpsc::Sender<Result<Packet, TransportError>>,
   outbound: mpsc::UnboundedReceiver<Packet>,
}

#[cfg(test)]
impl Peer {
   /// Delivers bytes to the host side as one read.
   pub async fn deliver(&self, bytes: &[u8]) {
      let _ = self.inbound.send(Ok(Packet::from_slice(bytes))).await;
   }

   /// Simulates the accessory dropping the channel.
   pub async fn hang_up(&self) {
      let _ = self.inbound.send(Err(TransportError::PeerClosed)).await;
   }

   /// Next packet written by the host.
   pub async fn written(&mut self) -> Option<Packet> {
      self.outbound.recv().await
   }
}

/// Builds a connected in-memory link and its accessory end.
#[cfg(test)]
pub fn loopback() -> (Link, Peer) {
   let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(128);
   let (in_tx, in_rx) = mpsc::channel(128);
   let (out_tx, out_rx) = mpsc::unbounded_channel();

   let mut tasks = JoinSet::new();
   tasks.spawn(async move {
      while let Some(cmd) = cmd_rx.recv().await {
         match cmd {
            Command::Send { data, then } => {
               let res = out_tx.send(data).map_err(|_| broken_pipe());
               let _ = then.send(res);
            },
            Command::Flush { then } => {
               let _ = then.send(());
            },
         }
      }
   });

   let link = Link {
      receiver: L2CapReceiver { rx: in_rx },
      sender: L2CapSender { tx: cmd_tx },
      tasks,
   };
   let peer = Peer {
      inbound: in_tx,
      outbound: out_rx,
   };
   (link, peer)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn options_struct_matches_kernel_layout() {
      assert_eq!(mem::size_of::<L2capOptions>(), 12);
   }

   #[tokio::test]
   async fn loopback_carries_both_directions() {
      let (mut link, mut peer) = loopback();

      link.sender().send(&[0x01, 0x02]).await.unwrap();
      assert_eq!(peer.written().await.unwrap().as_slice(), &[0x01, 0x02]);

      peer.deliver(&[0xaa]).await;
      assert_eq!(link.recv().await.unwrap().as_slice(), &[0xaa]);

      peer.hang_up().await;
      assert!(matches!(link.recv().await, Err(TransportError::PeerClosed)));
   }

   #[tokio::test]
   async fn dropped_peer_reads_as_closed_and_writes_fail() {
      let (mut link, peer) = loopback();
      drop(peer);
      assert!(matches!(link.recv().await, Err(TransportError::PeerClosed)));
      assert!(matches!(
         link.sender().send(&[0x00]).await,
         Err(TransportError::WriteError(_))
      ));
   }

   #[tokio::test]
   async fn dropping_link_closes_sender() {
      let (link, _peer) = loopback();
      let sender = link.sender().clone();
      drop(link);
      tokio::task::yield_now().await;
      assert!(sender.send(&[0x00]).await.is_err());
   }
}
