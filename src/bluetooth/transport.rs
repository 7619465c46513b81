//! Transport seam between sessions and the L2CAP socket layer.

use std::sync::Arc;

use bluer::Address;
use futures::future::BoxFuture;

use crate::{
   bluetooth::l2cap::{self, Link},
   error::TransportError,
};

/// Opens transport links to accessories.
pub trait Connector: Send + Sync + 'static {
   fn open(&self, address: Address) -> BoxFuture<'static, Result<Link, TransportError>>;
}

pub type SharedConnector = Arc<dyn Connector>;

/// Production connector: ERTM L2CAP channels through BlueZ.
#[derive(Debug, Clone, Copy)]
pub struct L2CapConnector {
   psm: u16,
}

impl L2CapConnector {
   pub const fn new() -> Self {
      Self {
         psm: l2cap::PSM_CONTROL,
      }
   }
}

impl Connector for L2CapConnector {
   fn open(&self, address: Address) -> BoxFuture<'static, Result<Link, TransportError>> {
      Box::pin(l2cap::connect(address, self.psm))
   }
}
