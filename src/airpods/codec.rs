//! Incremental AAP frame decoder and outbound encoder.
//!
//! Reads from the accessory may split a record across several chunks or
//! carry several records in one chunk. [`Decoder`] buffers bytes and hands out
//! one [`Message`] at a time. A corrupt header throws the whole buffer away so
//! the next read starts on a record boundary; a well-framed record with bad
//! field values is skipped on its own.
//!
//! The L2CAP link is a SeqPacket socket, so one read is one whole packet.
//! A session calls [`Decoder::end_of_read`] after draining each packet, and
//! whatever is left over at that point is a truncated record that is dropped
//! rather than glued onto the next packet.

use std::str;

use log::debug;
use smol_str::SmolStr;

use crate::{
   airpods::protocol::{
      BATTERY_ENTRY_LEN, BATTERY_PREFIX_LEN, BatteryInfo, BatteryState, BatteryStatus,
      CONTROL_LEN, Component, DeviceCommand, EAR_DETECTION_LEN, EarDetectionStatus, FeatureCmd,
      FeatureId, HDR_DATA, HDR_HANDSHAKE_REPLY, HDR_LEN, MAX_BATTERY_ENTRIES, NoiseControlMode,
      OP_BATTERY, OP_CONTROL, OP_EAR_DETECTION, OP_FEATURES_ACK, OP_METADATA, PKT_HANDSHAKE,
      PKT_REQUEST_NOTIFY, PKT_SET_FEATURES, Percent, SETTING_NOISE_CONTROL,
   },
   bluetooth::l2cap::Packet,
   error::ProtocolError,
};

/// Upper bound on buffered bytes; anything larger cannot be a valid record.
const MAX_BUFFERED: usize = 4096;

/// A decoded inbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
   Handshake,
   BatteryStatus(BatteryInfo),
   NoiseModeStatus(NoiseControlMode),
   EarDetection(EarDetectionStatus),
   FeatureAck,
   FeatureStatus { feature: FeatureId, enabled: bool },
   Metadata { name: Option<SmolStr> },
   Unknown { opcode: u16 },
}

enum Framing {
   /// Record has a known total length.
   Fixed(usize),
   /// Record extends to the end of the buffered read.
   ToBoundary,
   /// Not enough bytes yet to tell.
   Incomplete,
}

#[derive(Debug, Default)]
pub struct Decoder {
   buf: Vec<u8>,
}

impl Decoder {
   pub const fn new() -> Self {
      Self { buf: Vec::new() }
   }

   /// Appends one read's worth of bytes.
   pub fn push(&mut self, bytes: &[u8]) {
      self.buf.extend_from_slice(bytes);
   }

   #[cfg(test)]
   pub fn buffered(&self) -> usize {
      self.buf.len()
   }

   /// Closes out one packet. Bytes still buffered belong to a record the
   /// packet cut short; they are discarded and reported as `Malformed`.
   pub fn end_of_read(&mut self) -> Result<(), ProtocolError> {
      if self.buf.is_empty() {
         return Ok(());
      }
      debug!("Discarding {} trailing bytes", self.buf.len());
      self.reset();
      Err(ProtocolError::malformed("truncated record"))
   }

   /// Drops any partially buffered record.
   pub fn reset(&mut self) {
      self.buf.clear();
   }

   /// Decodes the next complete record, if any.
   ///
   /// `Ok(None)` means more bytes are needed. After an `Err` the decoder is
   /// still usable; see the module docs for what was discarded.
   pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
      if self.buf.is_empty() {
         return Ok(None);
      }
      if self.buf.len() > MAX_BUFFERED {
         self.reset();
         return Err(ProtocolError::malformed("buffer overflow without a complete record"));
      }

      let len = match self.framing() {
         Ok(Framing::Incomplete) => return Ok(None),
         Ok(Framing::Fixed(len)) if len > self.buf.len() => return Ok(None),
         Ok(Framing::Fixed(len)) => len,
         Ok(Framing::ToBoundary) => self.buf.len(),
         Err(e) => {
            debug!("Resynchronising after {} bytes: {e}", self.buf.len());
            self.reset();
            return Err(e);
         },
      };

      let record: Vec<u8> = self.buf.drain(..len).collect();
      decode_record(&record).map(Some)
   }

   fn framing(&self) -> Result<Framing, ProtocolError> {
      let buf = &self.buf;
      let hdr_avail = buf.len().min(HDR_LEN);
      let is_data = HDR_DATA.starts_with(&buf[..hdr_avail]);
      let is_reply = HDR_HANDSHAKE_REPLY.starts_with(&buf[..hdr_avail]);
      if !is_data && !is_reply {
         return Err(ProtocolError::malformed("bad service header"));
      }
      if buf.len() < HDR_LEN {
         return Ok(Framing::Incomplete);
      }
      if is_reply {
         return Ok(Framing::ToBoundary);
      }
      let Some(opcode) = opcode(buf) else {
         return Ok(Framing::Incomplete);
      };
      Ok(match opcode {
         OP_BATTERY => {
            let Some(&count) = buf.get(BATTERY_PREFIX_LEN - 1) else {
               return Ok(Framing::Incomplete);
            };
            if usize::from(count) > MAX_BATTERY_ENTRIES {
               return Err(ProtocolError::malformed("battery entry count out of range"));
            }
            Framing::Fixed(BATTERY_PREFIX_LEN + BATTERY_ENTRY_LEN * usize::from(count))
         },
         OP_EAR_DETECTION => Framing::Fixed(EAR_DETECTION_LEN),
         OP_CONTROL => Framing::Fixed(CONTROL_LEN),
         _ => Framing::ToBoundary,
      })
   }
}

fn opcode(data: &[u8]) -> Option<u16> {
   let bytes = data.get(HDR_LEN..HDR_LEN + 2)?;
   Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Decodes one complete, correctly framed record.
fn decode_record(data: &[u8]) -> Result<Message, ProtocolError> {
   if data.starts_with(HDR_HANDSHAKE_REPLY) {
      return Ok(Message::Handshake);
   }
   let op = opcode(data).ok_or(ProtocolError::malformed("record shorter than its header"))?;
   match op {
      OP_BATTERY => parse_battery_status(data).map(Message::BatteryStatus),
      OP_EAR_DETECTION => parse_ear_detection(data).map(Message::EarDetection),
      OP_CONTROL => parse_control(data),
      OP_FEATURES_ACK => Ok(Message::FeatureAck),
      OP_METADATA => Ok(Message::Metadata {
         name: parse_metadata_name(data),
      }),
      opcode => Ok(Message::Unknown { opcode }),
   }
}

/// Parses a battery record: up to four 5-byte entries of
/// `[component, 0x01, level, status, 0x01]`.
fn parse_battery_status(data: &[u8]) -> Result<BatteryInfo, ProtocolError> {
   let mut info = BatteryInfo::new();
   let entries = data[BATTERY_PREFIX_LEN..].chunks_exact(BATTERY_ENTRY_LEN);
   for entry in entries {
      let component = Component::from_repr(entry[0])
         .ok_or(ProtocolError::malformed("unknown battery component"))?;
      let status = BatteryStatus::from_repr(entry[3])
         .ok_or(ProtocolError::malformed("unknown battery status"))?;
      if status == BatteryStatus::Disconnected {
         continue;
      }
      let level =
         Percent::new(entry[2]).ok_or(ProtocolError::malformed("battery level out of range"))?;
      *info.slot_mut(component) = Some(BatteryState { level, status });
   }
   Ok(info)
}

/// Ear state bytes: 0 = in ear, 1 = out of ear, 2 = in case.
fn parse_ear_detection(data: &[u8]) -> Result<EarDetectionStatus, ProtocolError> {
   let in_ear = |b: u8| match b {
      0x00 => Ok(true),
      0x01 | 0x02 => Ok(false),
      _ => Err(ProtocolError::malformed("unknown ear state")),
   };
   Ok(EarDetectionStatus::new(
      in_ear(data[HDR_LEN + 2])?,
      in_ear(data[HDR_LEN + 3])?,
   ))
}

fn parse_control(data: &[u8]) -> Result<Message, ProtocolError> {
   let setting = data[HDR_LEN + 2];
   let value = u32::from_le_bytes([
      data[HDR_LEN + 3],
      data[HDR_LEN + 4],
      data[HDR_LEN + 5],
      data[HDR_LEN + 6],
   ]);
   if setting == SETTING_NOISE_CONTROL {
      return NoiseControlMode::from_repr(value)
         .map(Message::NoiseModeStatus)
         .ok_or(ProtocolError::malformed("unknown noise control mode"));
   }
   match FeatureCmd::from_repr(value) {
      Some(FeatureCmd::Enable) => Ok(Message::FeatureStatus {
         feature: FeatureId::from_id(setting),
         enabled: true,
      }),
      Some(FeatureCmd::Disable) => Ok(Message::FeatureStatus {
         feature: FeatureId::from_id(setting),
         enabled: false,
      }),
      // Other settings carry non-boolean values we do not track.
      _ => Ok(Message::Unknown { opcode: OP_CONTROL }),
   }
}

/// Scans the metadata payload for the first printable run that looks like a
/// product name.
fn parse_metadata_name(data: &[u8]) -> Option<SmolStr> {
   let payload = data.get(HDR_LEN + 2..)?;
   payload
      .split(|b| !b.is_ascii_graphic() && *b != b' ')
      .filter_map(|run| str::from_utf8(run).ok())
      .map(str::trim)
      .find(|text| text.len() > 2 && text.chars().any(char::is_alphabetic))
      .map(SmolStr::from)
}

/// Outbound records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
   Handshake,
   NegotiateFeatures,
   RequestNotifications,
   SetNoiseMode(NoiseControlMode),
   SetFeature(FeatureId, bool),
   Raw(Vec<u8>),
}

impl From<DeviceCommand> for Outbound {
   fn from(cmd: DeviceCommand) -> Self {
      match cmd {
         DeviceCommand::SetNoiseMode(mode) => Self::SetNoiseMode(mode),
         DeviceCommand::SetFeature(feature, enabled) => Self::SetFeature(feature, enabled),
         DeviceCommand::RequestBattery => Self::RequestNotifications,
         DeviceCommand::Passthrough(bytes) => Self::Raw(bytes),
      }
   }
}

/// Builds a control-setting record.
fn build_control_packet(setting: u8, value: u32) -> Packet {
   HDR_DATA
      .iter()
      .copied()
      .chain(OP_CONTROL.to_le_bytes())
      .chain([setting])
      .chain(value.to_le_bytes())
      .collect()
}

pub fn encode(out: &Outbound) -> Packet {
   match out {
      Outbound::Handshake => Packet::from_slice(PKT_HANDSHAKE),
      Outbound::NegotiateFeatures => Packet::from_slice(PKT_SET_FEATURES),
      Outbound::RequestNotifications => Packet::from_slice(PKT_REQUEST_NOTIFY),
      Outbound::SetNoiseMode(mode) => build_control_packet(SETTING_NOISE_CONTROL, *mode as u32),
      Outbound::SetFeature(feature, enabled) => {
         let cmd = if *enabled {
            FeatureCmd::Enable
         } else {
            FeatureCmd::Disable
         };
         build_control_packet(feature.id(), cmd as u32)
      },
      Outbound::Raw(bytes) => Packet::from_slice(bytes),
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const BATTERY: &[u8] = &[
      0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x03, // header, opcode, count
      0x04, 0x01, 0x50, 0x02, 0x01, // left 80 discharging
      0x02, 0x01, 0x4c, 0x02, 0x01, // right 76 discharging
      0x08, 0x01, 0x3c, 0x01, 0x01, // case 60 charging
   ];
   const NOISE_ANC: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x02, 0x00, 0x00, 0x00];
   const EAR_LEFT_ONLY: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x00, 0x01];

   fn drain(decoder: &mut Decoder) -> Vec<Result<Message, ProtocolError>> {
      let mut out = Vec::new();
      loop {
         match decoder.next_message() {
            Ok(Some(m)) => out.push(Ok(m)),
            Ok(None) => return out,
            Err(e) => out.push(Err(e)),
         }
      }
   }

   #[test]
   fn decodes_battery_levels() {
      let mut d = Decoder::new();
      d.push(BATTERY);
      let Ok(Some(Message::BatteryStatus(info))) = d.next_message() else {
         panic!("expected battery status");
      };
      assert_eq!(info.left.map(|s| s.level.get()), Some(80));
      assert_eq!(info.right.map(|s| s.level.get()), Some(76));
      assert_eq!(info.case.map(|s| s.level.get()), Some(60));
      assert!(info.case.is_some_and(|s| s.is_charging()));
      assert!(info.headphone.is_none());
      assert_eq!(d.buffered(), 0);
   }

   #[test]
   fn truncated_packet_does_not_swallow_the_next() {
      let mut d = Decoder::new();
      d.push(&BATTERY[..5]);
      assert_eq!(d.next_message(), Ok(None));
      assert!(matches!(
         d.end_of_read(),
         Err(ProtocolError::Malformed { .. })
      ));
      assert_eq!(d.buffered(), 0);

      d.push(BATTERY);
      assert!(matches!(
         d.next_message(),
         Ok(Some(Message::BatteryStatus(_)))
      ));
      assert_eq!(d.end_of_read(), Ok(()));
   }

   #[test]
   fn split_record_waits_for_the_rest() {
      let mut d = Decoder::new();
      d.push(&BATTERY[..5]);
      assert_eq!(d.next_message(), Ok(None));
      d.push(&BATTERY[5..12]);
      assert_eq!(d.next_message(), Ok(None));
      d.push(&BATTERY[12..]);
      assert!(matches!(d.next_message(), Ok(Some(Message::BatteryStatus(_)))));
   }

   #[test]
   fn coalesced_records_decode_in_order() {
      let mut d = Decoder::new();
      let mut chunk = Vec::new();
      chunk.extend_from_slice(NOISE_ANC);
      chunk.extend_from_slice(EAR_LEFT_ONLY);
      chunk.extend_from_slice(BATTERY);
      d.push(&chunk);

      let msgs = drain(&mut d);
      assert_eq!(msgs.len(), 3);
      assert_eq!(msgs[0], Ok(Message::NoiseModeStatus(NoiseControlMode::Anc)));
      assert_eq!(
         msgs[1],
         Ok(Message::EarDetection(EarDetectionStatus::new(true, false)))
      );
      assert!(matches!(msgs[2], Ok(Message::BatteryStatus(_))));
   }

   #[test]
   fn handshake_reply_consumes_its_read() {
      let mut d = Decoder::new();
      d.push(&[0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00]);
      assert_eq!(d.next_message(), Ok(Some(Message::Handshake)));
      assert_eq!(d.next_message(), Ok(None));
   }

   #[test]
   fn out_of_range_level_is_rejected() {
      let mut bad = BATTERY.to_vec();
      bad[9] = 0xc8; // 200%
      let mut d = Decoder::new();
      d.push(&bad);
      d.push(NOISE_ANC);
      assert!(matches!(
         d.next_message(),
         Err(ProtocolError::Malformed { .. })
      ));
      // Only the bad record was skipped.
      assert_eq!(
         d.next_message(),
         Ok(Some(Message::NoiseModeStatus(NoiseControlMode::Anc)))
      );
   }

   #[test]
   fn disconnected_components_stay_unknown() {
      let mut d = Decoder::new();
      d.push(&[
         0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x02, 0x04, 0x01, 0x00, 0x04, 0x01, 0x02, 0x01,
         0x63, 0x00, 0x01,
      ]);
      let Ok(Some(Message::BatteryStatus(info))) = d.next_message() else {
         panic!("expected battery status");
      };
      assert!(info.left.is_none());
      assert_eq!(info.right.map(|s| s.level.get()), Some(99));
   }

   #[test]
   fn garbage_header_resynchronises() {
      let mut d = Decoder::new();
      d.push(&[0xde, 0xad, 0xbe, 0xef, 0x04, 0x00]);
      assert!(matches!(
         d.next_message(),
         Err(ProtocolError::Malformed { .. })
      ));
      assert_eq!(d.buffered(), 0);
      d.push(EAR_LEFT_ONLY);
      assert!(matches!(d.next_message(), Ok(Some(Message::EarDetection(_)))));
   }

   #[test]
   fn impossible_battery_count_resynchronises() {
      let mut d = Decoder::new();
      d.push(&[0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x09, 0x04]);
      assert!(matches!(
         d.next_message(),
         Err(ProtocolError::Malformed { .. })
      ));
      assert_eq!(d.buffered(), 0);
   }

   #[test]
   fn unknown_opcode_is_not_an_error() {
      let mut d = Decoder::new();
      d.push(&[0x04, 0x00, 0x04, 0x00, 0x77, 0x00, 0x01, 0x02, 0x03]);
      assert_eq!(
         d.next_message(),
         Ok(Some(Message::Unknown { opcode: 0x0077 }))
      );
      assert_eq!(d.buffered(), 0);
   }

   #[test]
   fn unknown_noise_mode_is_rejected() {
      let mut d = Decoder::new();
      d.push(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x09, 0x00, 0x00, 0x00]);
      assert!(matches!(
         d.next_message(),
         Err(ProtocolError::Malformed { .. })
      ));
   }

   #[test]
   fn feature_status_reports() {
      let mut d = Decoder::new();
      d.push(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x28, 0x01, 0x00, 0x00, 0x00]);
      assert_eq!(
         d.next_message(),
         Ok(Some(Message::FeatureStatus {
            feature: FeatureId::CONVERSATIONAL,
            enabled: true,
         }))
      );
   }

   #[test]
   fn metadata_name_is_extracted() {
      let mut d = Decoder::new();
      let mut pkt = vec![0x04, 0x00, 0x04, 0x00, 0x1d, 0x00, 0x02, 0x00];
      pkt.extend_from_slice(b"AirPods Pro\x00A2084\x00");
      d.push(&pkt);
      assert_eq!(
         d.next_message(),
         Ok(Some(Message::Metadata {
            name: Some("AirPods Pro".into()),
         }))
      );
   }

   #[test]
   fn encodes_control_settings() {
      assert_eq!(
         encode(&Outbound::SetNoiseMode(NoiseControlMode::Anc)).as_slice(),
         NOISE_ANC
      );
      assert_eq!(
         encode(&Outbound::SetFeature(FeatureId::CONVERSATIONAL, false)).as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x28, 0x02, 0x00, 0x00, 0x00]
      );
      assert_eq!(
         encode(&DeviceCommand::RequestBattery.into()).as_slice(),
         PKT_REQUEST_NOTIFY
      );
   }
}
