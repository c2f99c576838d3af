/// SwitchBot BLE advertisement decoding
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::Reading;

/// SwitchBot device type codes as carried in service data byte 2
pub mod device_type {
    pub const CO2: u8 = 0x35;
    pub const METER: u8 = 0x54;
    pub const CONTACT: u8 = 0x64;
    pub const PLUG_MINI: u8 = 0x67;
    pub const METER_PLUS: u8 = 0x69;
    pub const PLUG_MINI_2: u8 = 0x6a;
    pub const HUB_MINI: u8 = 0x6d;
    pub const COLOR_BULB: u8 = 0x75;
    pub const OUTDOOR_METER: u8 = 0x77;
}

// Expected manufacturer payload sizes (after the 8-byte header)
const METER_SIZE: usize = 5;
const OUTDOOR_METER_SIZE: usize = 6;
const CO2_SIZE: usize = 10;
const BULB_SIZE: usize = 5;
const PLUG_SIZE: usize = 6;
const CONTACT_SIZE: usize = 7;
const CONTACT_SERVICE_MIN: usize = 11;
const METER_SERVICE_MIN: usize = 6;

/// A decoder turns (manufacturer payload, service data) into a reading
pub type Decoder = Arc<dyn Fn(&[u8], &[u8]) -> Option<Reading> + Send + Sync>;

/// Dispatch table from device type code to decoder
#[derive(Clone, Default)]
pub struct DecoderTable {
    decoders: HashMap<u8, Decoder>,
}

impl DecoderTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table with every supported SwitchBot device registered
    pub fn switchbot() -> Self {
        let mut table = Self::empty();
        table.register(device_type::CO2, |m, _| decode_co2(m));
        table.register(device_type::METER, |m, s| decode_meter(m, s, METER_SIZE));
        table.register(device_type::CONTACT, decode_contact);
        table.register(device_type::PLUG_MINI, |m, _| decode_plug(m));
        table.register(device_type::METER_PLUS, |m, s| decode_meter(m, s, METER_SIZE));
        table.register(device_type::PLUG_MINI_2, |m, _| decode_plug(m));
        table.register(device_type::HUB_MINI, |m, _| decode_hub(m));
        table.register(device_type::COLOR_BULB, |m, _| decode_bulb(m));
        table.register(device_type::OUTDOOR_METER, |m, s| {
            decode_meter(m, s, OUTDOOR_METER_SIZE)
        });
        table
    }

    /// Register (or replace) the decoder for a device type
    pub fn register<F>(&mut self, code: u8, decoder: F)
    where
        F: Fn(&[u8], &[u8]) -> Option<Reading> + Send + Sync + 'static,
    {
        self.decoders.insert(code, Arc::new(decoder));
    }

    pub fn supports(&self, code: u8) -> bool {
        self.decoders.contains_key(&code)
    }

    /// Decode one advertisement, `None` for unknown types or malformed payloads
    ///
    /// # Arguments
    /// * `code` - Configured device type
    /// * `manufacturer` - Manufacturer payload with the 8-byte header already removed
    /// * `service` - Raw service data (may be empty)
    pub fn decode(&self, code: u8, manufacturer: &[u8], service: &[u8]) -> Option<Reading> {
        match self.decoders.get(&code) {
            Some(decoder) => decoder(manufacturer, service),
            None => {
                warn!("Unknown device type={:#x}", code);
                None
            }
        }
    }
}

/// Fields shared by every meter style manufacturer payload
///
/// - Byte 0: Sequence number
/// - Byte 2 (low nibble): Tenths of a degree
/// - Byte 3: Bit 7 sign (1 = above zero), bits 0-6 whole degrees
/// - Byte 4 (bits 0-6): Relative humidity %
fn meter_fields(m: &[u8]) -> Reading {
    let sign = if m[3] & 0x80 != 0 { 1 } else { -1 };
    let tenths = (m[3] & 0x7f) as i64 * 10 + (m[2] & 0x0f) as i64;
    Reading::new()
        .with("sq", m[0])
        .with("dcE1", sign * tenths)
        .with("rh", m[4] & 0x7f)
}

/// Optional meter enrichment from service data: battery and alert flags
fn meter_service_fields(s: &[u8]) -> Reading {
    Reading::new()
        .with("bt", s[4] & 0x7f)
        .with("ts", s[5] >> 6)
        .with("hs", (s[5] >> 4) & 3)
}

/// Thermo-hygrometer (standard, plus and outdoor variants)
pub fn decode_meter(m: &[u8], s: &[u8], size: usize) -> Option<Reading> {
    if m.len() != size {
        debug!("Meter: size error {}({})", hex::encode(m), m.len());
        return None;
    }
    let mut reading = meter_fields(m);
    if s.len() >= METER_SERVICE_MIN {
        reading = reading.merged(&meter_service_fields(s));
    }
    Some(reading)
}

/// CO2 sensor: meter fields plus CO2 ppm in bytes 7-8 (big endian)
pub fn decode_co2(m: &[u8]) -> Option<Reading> {
    if m.len() != CO2_SIZE {
        error!("CO2: size error {}({})", hex::encode(m), m.len());
        return None;
    }
    Some(meter_fields(m).with("CO2", u16::from_be_bytes([m[7], m[8]]) as i64))
}

/// Color bulb: power state and brightness
pub fn decode_bulb(m: &[u8]) -> Option<Reading> {
    if m.len() != BULB_SIZE {
        error!("Bulb: size error {}({})", hex::encode(m), m.len());
        return None;
    }
    Some(
        Reading::new()
            .with("sq", m[0])
            .with("on", m[1] >> 7)
            .with("br", m[1] & 0x7f),
    )
}

/// Plug Mini (both revisions): power state and load in tenths of a watt
pub fn decode_plug(m: &[u8]) -> Option<Reading> {
    if m.len() != PLUG_SIZE {
        error!("Plug: size error {}({})", hex::encode(m), m.len());
        return None;
    }
    Some(
        Reading::new()
            .with("sq", m[0])
            .with("on", m[1] >> 7)
            .with("pwrE1", (m[4] & 0x7f) as i64 * 256 + m[5] as i64),
    )
}

/// Contact sensor: everything of interest lives in the service data
pub fn decode_contact(m: &[u8], s: &[u8]) -> Option<Reading> {
    if m.len() != CONTACT_SIZE {
        error!("Contact: size error {}({})", hex::encode(m), m.len());
        return None;
    }
    if s.len() < CONTACT_SERVICE_MIN {
        return None;
    }
    Some(
        Reading::new()
            .with("bt", s[4] & 0x7f)
            .with("dr", (s[4] >> 1) & 3)
            .with("lux", s[4] & 1)
            .with(
                "pir",
                (s[5] >> 7) as i64 * 0x10000 + s[6] as i64 * 0x100 + s[7] as i64,
            )
            .with(
                "hal",
                ((s[5] >> 6) & 1) as i64 * 0x10000 + s[8] as i64 * 0x100 + s[9] as i64,
            ),
    )
}

/// Hub Mini: only the sequence number is meaningful
pub fn decode_hub(m: &[u8]) -> Option<Reading> {
    match m.first() {
        Some(sq) => Some(Reading::new().with("sq", *sq)),
        None => {
            error!("Hub: size error (0)");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_positive_temperature() {
        // sign bit set, 23 whole degrees, 4 tenths, 55 %
        let reading = decode_meter(&[7, 0, 0x04, 0x80 | 23, 55], &[], 5).unwrap();
        assert_eq!(reading.int("sq"), Some(7));
        assert_eq!(reading.int("dcE1"), Some(234));
        assert_eq!(reading.int("rh"), Some(55));
        assert_eq!(reading.len(), 3);
    }

    #[test]
    fn meter_negative_temperature_and_humidity_mask() {
        let reading = decode_meter(&[1, 0, 0x35, 5, 0x80 | 40], &[], 5).unwrap();
        assert_eq!(reading.int("dcE1"), Some(-55));
        assert_eq!(reading.int("rh"), Some(40));
    }

    #[test]
    fn meter_sign_clear_payload() {
        // byte 3 carries no sign bit so the value reads as non-positive
        let reading = decode_meter(&[5, 0, 0, 0, 50], &[], 5).unwrap();
        assert_eq!(reading.int("sq"), Some(5));
        assert_eq!(reading.int("dcE1"), Some(0));
        assert_eq!(reading.int("rh"), Some(50));
    }

    #[test]
    fn meter_service_enrichment() {
        let service = [0x3d, 0xfd, 0x54, 0x00, 0xe4, 0b1001_0000];
        let reading = decode_meter(&[0, 0, 0, 0x80, 0], &service, 5).unwrap();
        assert_eq!(reading.int("bt"), Some(0x64));
        assert_eq!(reading.int("ts"), Some(2));
        assert_eq!(reading.int("hs"), Some(1));

        let short = decode_meter(&[0, 0, 0, 0x80, 0], &service[..5], 5).unwrap();
        assert_eq!(short.get("bt"), None);
    }

    #[test]
    fn size_mismatch_is_no_reading() {
        let table = DecoderTable::switchbot();
        for len in [0usize, 1, 4, 6, 9, 11] {
            let payload = vec![0u8; len];
            if len != 5 {
                assert!(table.decode(device_type::METER, &payload, &[]).is_none());
                assert!(table.decode(device_type::COLOR_BULB, &payload, &[]).is_none());
            }
            if len != 6 {
                assert!(table.decode(device_type::PLUG_MINI, &payload, &[]).is_none());
                assert!(table.decode(device_type::OUTDOOR_METER, &payload, &[]).is_none());
            }
            if len != 10 {
                assert!(table.decode(device_type::CO2, &payload, &[]).is_none());
            }
            if len != 7 {
                assert!(table
                    .decode(device_type::CONTACT, &payload, &[0u8; 12])
                    .is_none());
            }
        }
    }

    #[test]
    fn co2_reads_big_endian_ppm() {
        let m = [9, 0, 0x02, 0x80 | 21, 45, 0, 0, 0x03, 0x20, 0];
        let reading = decode_co2(&m).unwrap();
        assert_eq!(reading.int("CO2"), Some(800));
        assert_eq!(reading.int("dcE1"), Some(212));
        assert_eq!(reading.int("rh"), Some(45));
    }

    #[test]
    fn plug_wattage_in_tenths() {
        let reading = decode_plug(&[3, 0x80, 0, 0, 0x81, 0x10]).unwrap();
        assert_eq!(reading.int("on"), Some(1));
        assert_eq!(reading.int("pwrE1"), Some(256 + 0x10));
    }

    #[test]
    fn bulb_power_and_brightness() {
        let reading = decode_bulb(&[2, 0x80 | 75, 0, 0, 0]).unwrap();
        assert_eq!(reading.int("on"), Some(1));
        assert_eq!(reading.int("br"), Some(75));
    }

    #[test]
    fn contact_needs_service_data() {
        let m = [0xcb, 0x23, 0xff, 0xff, 0xe1, 0xb9, 0xc0];
        assert!(decode_contact(&m, &[0x3d, 0xfd, 0x64]).is_none());

        let s = [0x3d, 0xfd, 0x64, 0x00, 0x00, 0xc4, 0xff, 0xff, 0xe1, 0xba, 0xc0];
        let reading = decode_contact(&m, &s).unwrap();
        assert_eq!(reading.int("pir"), Some(0x1ffff));
        assert_eq!(reading.int("hal"), Some(0x1e1ba));
        assert_eq!(reading.int("dr"), Some(0));
    }

    #[test]
    fn hub_sequence_only() {
        assert_eq!(decode_hub(&[42]).unwrap().int("sq"), Some(42));
        assert!(decode_hub(&[]).is_none());
    }

    #[test]
    fn registered_decoders_extend_dispatch() {
        let mut table = DecoderTable::empty();
        assert!(table.decode(0x01, &[1], &[]).is_none());
        table.register(0x01, |m, _| Some(Reading::new().with("raw", m[0])));
        assert!(table.supports(0x01));
        assert_eq!(table.decode(0x01, &[9], &[]).unwrap().int("raw"), Some(9));
    }
}
