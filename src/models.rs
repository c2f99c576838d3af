/// Data types shared by the acquisition, storage and query layers
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// One `[watts, label]` pair of a generation or consumption breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry(pub i64, pub String);

/// A single scalar or list value inside a reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Text(String),
    Breakdown(Vec<Entry>),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<u8> for FieldValue {
    fn from(value: u8) -> Self {
        FieldValue::Int(value as i64)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Int(value as i64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<Entry>> for FieldValue {
    fn from(value: Vec<Entry>) -> Self {
        FieldValue::Breakdown(value)
    }
}

/// Field name -> value mapping produced by a decoder or the appliance scraper.
///
/// Absent fields mean "not applicable" for the source, never zero.
/// Well-known fields: `dcE1` (temperature, tenths of °C), `rh` (relative
/// humidity %), `CO2` (ppm), `pwrE1` (tenths of W), `sq` (sequence number),
/// `gen`/`use` (watt breakdowns), `name` (display name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reading(BTreeMap<String, FieldValue>);

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &str, value: impl Into<FieldValue>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Builder form of [`Reading::insert`]
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    /// Integer field lookup, `None` when absent or not an integer
    pub fn int(&self, field: &str) -> Option<i64> {
        match self.0.get(field) {
            Some(FieldValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.0.get(field) {
            Some(FieldValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    pub fn breakdown(&self, field: &str) -> Option<&[Entry]> {
        match self.0.get(field) {
            Some(FieldValue::Breakdown(v)) => Some(v),
            _ => None,
        }
    }

    /// Overlay `update` onto a copy of `self`; fields missing from `update` survive.
    pub fn merged(&self, update: &Reading) -> Reading {
        let mut merged = self.clone();
        for (field, value) in &update.0 {
            merged.0.insert(field.clone(), value.clone());
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }
}

/// Latest reading of one logical device together with its update time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub dat: Reading,
    pub ut: i64,
}

/// Logical device key -> latest record
pub type DeviceMap = BTreeMap<String, DeviceRecord>;

/// One collection cycle: serialized as the tuple `[timestamp, {key: {dat, ut}}]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(i64, DeviceMap)")]
pub struct Snapshot {
    pub timestamp: i64,
    pub devices: DeviceMap,
}

impl Snapshot {
    pub fn new(timestamp: i64, devices: DeviceMap) -> Self {
        Snapshot { timestamp, devices }
    }
}

impl From<(i64, DeviceMap)> for Snapshot {
    fn from((timestamp, devices): (i64, DeviceMap)) -> Self {
        Snapshot { timestamp, devices }
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp, &self.devices).serialize(serializer)
    }
}
