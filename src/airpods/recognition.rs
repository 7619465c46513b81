//! Accessory recognition.
//!
//! A paired device counts as an accessory if any of its BlueZ properties
//! identify it: modalias first, then Apple proximity-pairing manufacturer
//! data, then Apple service UUIDs, and finally its name or alias.

use log::debug;
use uuid::Uuid;

/// Lowercase name fragments of supported accessories
const NAME_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];

/// Apple vendor ID in the device modalias
const APPLE_VID: u32 = 0x004C;

/// Apple company ID in manufacturer data
const APPLE_CID: u16 = 0x004C;

/// Proximity-pairing message type
const PP_TYPE: u8 = 0x07;

/// Offset of the product-id byte in a proximity-pairing message
const PID_OFFSET: usize = 6;

const PRODUCT_IDS: &[u32] = &[
   0x2002, // Beats, some AirPods
   0x200A, // AirPods (3rd gen)
   0x200E, // AirPods (2nd gen)
   0x200F, // Beats Solo Pro
   0x2012, // Powerbeats Pro
   0x2013, // AirPods Max
   0x2014, // AirPods Pro (2nd gen)
   0x2024, // AirPods Pro (1st gen)
];

static APPLE_SERVICES: [Uuid; 3] = [
   Uuid::from_u128(0x0000fd6f_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd39_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd32_0000_1000_8000_00805f9b34fb),
];

fn is_known_product(vendor: u32, product: u32) -> bool {
   vendor == APPLE_VID && PRODUCT_IDS.contains(&product)
}

fn is_proximity_pairing(data: &[u8]) -> bool {
   data.len() > PID_OFFSET
      && data[0] == PP_TYPE
      && PRODUCT_IDS
         .iter()
         .any(|&pid| (pid & 0xFF) as u8 == data[PID_OFFSET])
}

fn matches_name(name: &str) -> Option<&'static str> {
   let name = name.to_ascii_lowercase();
   NAME_PATTERNS.iter().copied().find(|p| name.contains(p))
}

pub async fn is_device_airpods(dev: &bluer::Device) -> bool {
   let addr = dev.address();

   if let Ok(Some(modalias)) = dev.modalias().await
      && is_known_product(modalias.vendor, modalias.product)
   {
      debug!("{addr}: Recognised by modalias {:#06x}", modalias.product);
      return true;
   }

   if let Ok(Some(mfg)) = dev.manufacturer_data().await
      && mfg.get(&APPLE_CID).is_some_and(|d| is_proximity_pairing(d))
   {
      debug!("{addr}: Recognised by manufacturer data");
      return true;
   }

   if let Ok(Some(uuids)) = dev.uuids().await
      && uuids.iter().any(|u| APPLE_SERVICES.contains(u))
   {
      debug!("{addr}: Recognised by service UUID");
      return true;
   }

   if let Ok(Some(name)) = dev.name().await
      && let Some(pattern) = matches_name(&name)
   {
      debug!("{addr}: Recognised by name {name:?} ({pattern})");
      return true;
   }

   if let Ok(alias) = dev.alias().await
      && let Some(pattern) = matches_name(&alias)
   {
      debug!("{addr}: Recognised by alias {alias:?} ({pattern})");
      return true;
   }

   false
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn modalias_requires_apple_vendor() {
      assert!(is_known_product(0x004C, 0x2014));
      assert!(!is_known_product(0x004C, 0x1234));
      assert!(!is_known_product(0x0075, 0x2014));
   }

   #[test]
   fn proximity_pairing_product_byte() {
      assert!(is_proximity_pairing(&[0x07, 0x19, 0x01, 0x0e, 0x20, 0x00, 0x14]));
      assert!(!is_proximity_pairing(&[0x07, 0x19, 0x01, 0x0e, 0x20, 0x00, 0x99]));
      assert!(!is_proximity_pairing(&[0x10, 0x19, 0x01, 0x0e, 0x20, 0x00, 0x14]));
      assert!(!is_proximity_pairing(&[0x07, 0x19]));
   }

   #[test]
   fn names_match_case_insensitively() {
      assert_eq!(matches_name("Jane's AirPods Pro"), Some("airpods"));
      assert_eq!(matches_name("POWERBEATS PRO"), Some("beats"));
      assert_eq!(matches_name("EarPods"), None);
   }
}
