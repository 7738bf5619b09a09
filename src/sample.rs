//! Sample and buffer-entry types: the unit of data that flows from a PLC
//! read through the data queue, the circular buffer, and finally the
//! Oracle writer or CSV spill.

use crate::mc3e::DeviceAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which remote table a sample is ultimately written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    DatatagLog,
    Operation,
}

impl Destination {
    pub fn as_str(self) -> &'static str {
        match self {
            Destination::DatatagLog => "datatag_log",
            Destination::Operation => "operation",
        }
    }
}

/// Semantic bucket of a tag. Chooses both the destination table and the
/// `DATATAG_TYPE` column value for rows written to `XSCADA_DATATAG_LOG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagKind {
    Alarm,
    BitPlc,
    BitHost,
    Operation,
    State,
    WordHost,
}

impl TagKind {
    /// `DATATAG_TYPE` is documented as single-char but the source also
    /// enumerates two-char `WH`/`BH` values; this column is treated as
    /// variable-width up to two characters, not strictly one.
    pub fn datatag_type(self) -> &'static str {
        match self {
            TagKind::Alarm => "A",
            TagKind::BitPlc => "B",
            TagKind::BitHost => "BH",
            TagKind::Operation => "O",
            TagKind::State => "S",
            TagKind::WordHost => "WH",
        }
    }

    /// Short token used inside the deterministic tag name.
    pub fn label(self) -> &'static str {
        match self {
            TagKind::Alarm => "ALM",
            TagKind::BitPlc => "BITP",
            TagKind::BitHost => "BITH",
            TagKind::Operation => "OPR",
            TagKind::State => "STA",
            TagKind::WordHost => "WRH",
        }
    }

    /// `Operation` and `State` route to `XSCADA_OPERATION`; every other
    /// kind routes to `XSCADA_DATATAG_LOG`.
    pub fn destination(self) -> Destination {
        match self {
            TagKind::Operation | TagKind::State => Destination::Operation,
            TagKind::Alarm | TagKind::BitPlc | TagKind::BitHost | TagKind::WordHost => {
                Destination::DatatagLog
            }
        }
    }
}

/// Quality flag attached to every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
}

/// Raw value as read from the PLC, before scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Bit(bool),
    Word(u16),
    DWord(u32),
    Real(f32),
    Text(String),
}

impl RawValue {
    /// Numeric view used for `VALUE_NUM` and for applying a tag's scale
    /// factor. Text values have no numeric representation.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Bit(b) => Some(if *b { 1.0 } else { 0.0 }),
            RawValue::Word(w) => Some(*w as f64),
            RawValue::DWord(d) => Some(*d as f64),
            RawValue::Real(r) => Some(*r as f64),
            RawValue::Text(_) => None,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            RawValue::Bit(b) => b.to_string(),
            RawValue::Word(w) => w.to_string(),
            RawValue::DWord(d) => d.to_string(),
            RawValue::Real(r) => r.to_string(),
            RawValue::Text(s) => s.clone(),
        }
    }
}

/// One reading, deterministically named and timestamped at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub plc_code: String,
    pub address: DeviceAddress,
    pub tag_name: String,
    pub kind: TagKind,
    pub raw_value: RawValue,
    pub scaled_value: f64,
    pub quality: Quality,
}

impl Sample {
    /// Deterministic tag name: `{plc}.{kind-label}.{machine_code}.{address}`.
    pub fn make_tag_name(plc_code: &str, kind: TagKind, machine_code: &str, address: DeviceAddress) -> String {
        format!("{plc_code}.{}.{machine_code}.{address}", kind.label())
    }

    pub fn new(
        plc_code: impl Into<String>,
        address: DeviceAddress,
        machine_code: &str,
        kind: TagKind,
        raw_value: RawValue,
        scale: f64,
        quality: Quality,
    ) -> Self {
        let plc_code = plc_code.into();
        let tag_name = Self::make_tag_name(&plc_code, kind, machine_code, address);
        let scaled_value = raw_value.as_f64().map(|v| v * scale).unwrap_or(0.0);
        Self {
            timestamp: Utc::now(),
            plc_code,
            address,
            tag_name,
            kind,
            raw_value,
            scaled_value,
            quality,
        }
    }
}

/// A sample plus the time it entered the circular buffer. The buffer
/// exclusively owns entries until `get` extracts them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEntry {
    pub sample: Sample,
    pub enqueued_at: DateTime<Utc>,
}

impl BufferEntry {
    pub fn new(sample: Sample) -> Self {
        Self {
            sample,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::DeviceCode;

    #[test]
    fn tag_name_format_matches_spec() {
        let addr = DeviceAddress::new(DeviceCode::D, 100);
        let name = Sample::make_tag_name("PLC01", TagKind::WordHost, "EQUIP0000001234", addr);
        assert_eq!(name, "PLC01.WRH.EQUIP0000001234.D100");
    }

    #[test]
    fn state_and_operation_route_to_operation_table() {
        assert_eq!(TagKind::Operation.destination(), Destination::Operation);
        assert_eq!(TagKind::State.destination(), Destination::Operation);
    }

    #[test]
    fn bit_and_word_and_alarm_route_to_datatag_log() {
        assert_eq!(TagKind::Alarm.destination(), Destination::DatatagLog);
        assert_eq!(TagKind::BitPlc.destination(), Destination::DatatagLog);
        assert_eq!(TagKind::BitHost.destination(), Destination::DatatagLog);
        assert_eq!(TagKind::WordHost.destination(), Destination::DatatagLog);
    }

    #[test]
    fn datatag_type_is_variable_width() {
        assert_eq!(TagKind::Alarm.datatag_type().len(), 1);
        assert_eq!(TagKind::WordHost.datatag_type().len(), 2);
        assert_eq!(TagKind::BitHost.datatag_type().len(), 2);
    }

    #[test]
    fn scaled_value_applies_scale_factor() {
        let addr = DeviceAddress::new(DeviceCode::D, 1);
        let sample = Sample::new(
            "PLC01",
            addr,
            "EQUIP0000000001",
            TagKind::WordHost,
            RawValue::Word(100),
            0.1,
            Quality::Good,
        );
        assert!((sample.scaled_value - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn text_value_has_no_numeric_scaling() {
        let addr = DeviceAddress::new(DeviceCode::D, 1);
        let sample = Sample::new(
            "PLC01",
            addr,
            "EQUIP0000000001",
            TagKind::Alarm,
            RawValue::Text("FAULT".into()),
            1.0,
            Quality::Good,
        );
        assert_eq!(sample.scaled_value, 0.0);
    }
}
