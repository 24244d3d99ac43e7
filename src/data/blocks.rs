//! Result and payload blocks.
//!
//! # Overview
//!
//! A [`DataBlock`] is one result returned by the server: a typed data array, its
//! uncertainties, one [`Dim`] per axis, status codes and the error trail attached to it.
//! Axes may arrive in a compressed form ([`Compression`]) that the dimension codec expands
//! on receipt.
//!
//! A [`PutDataBlock`] travels the other way, carrying caller data to the server.
//!
//! # See Also
//!
//! - [`compress`](crate::compress): expansion and compression of axes.
use bincode::{Decode, Encode};

use super::{
    error::{DEFAULT_STATUS, ErrorRecord},
    state::ClientBlock,
    types::{DataType, OpaqueType, Values},
};

/// Parametric description of a dimension axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Compression {
    /// Method 0: a single arithmetic run `dim0, dim0 + diff, ...`.
    Regular { dim0: f64, diff: f64 },
    /// Method 1: independent runs, run `r` holding `sams[r]` samples starting at `offs[r]`
    /// with stride `ints[r]`.
    Domains {
        sams: Vec<i32>,
        offs: Values,
        ints: Values,
    },
    /// Method 2: one explicit value per run.
    Offsets { offs: Values },
    /// Method 3: `udoms` values generated from a single offset and stride.
    Broadcast {
        udoms: u32,
        offs: Values,
        ints: Values,
    },
}

impl Compression {
    /// Wire tag of the method.
    pub fn method(&self) -> i32 {
        match self {
            Compression::Regular { .. } => 0,
            Compression::Domains { .. } => 1,
            Compression::Offsets { .. } => 2,
            Compression::Broadcast { .. } => 3,
        }
    }

    /// Number of runs described.
    pub fn udoms(&self) -> u32 {
        match self {
            Compression::Regular { .. } => 0,
            Compression::Domains { sams, .. } => sams.len() as u32,
            Compression::Offsets { offs } => offs.len() as u32,
            Compression::Broadcast { udoms, .. } => *udoms,
        }
    }
}

/// One axis of a data block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dim {
    pub data_type: DataType,
    pub dim_n: u32,
    /// Expanded coordinate values. May be absent while the axis is compressed.
    pub values: Option<Values>,
    /// Present when the axis is (or was received) compressed. Never removed by expansion.
    pub compression: Option<Compression>,
    pub error_type: DataType,
    pub error_model: i32,
    pub error_asymmetry: bool,
    pub error_params: Vec<f32>,
    pub errhi: Option<Values>,
    pub errlo: Option<Values>,
    pub units: String,
    pub label: String,
}

impl Dim {
    pub fn new(values: Values) -> Self {
        Self {
            data_type: values.data_type(),
            dim_n: values.len() as u32,
            values: Some(values),
            ..Self::default()
        }
    }

    /// Build an axis from its compressed description alone.
    pub fn compressed(data_type: DataType, dim_n: u32, compression: Compression) -> Self {
        Self {
            data_type,
            dim_n,
            compression: Some(compression),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: &str, units: &str) -> Self {
        self.label = label.to_string();
        self.units = units.to_string();
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }
}

/// One result returned by the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataBlock {
    pub rank: u32,
    pub order: i32,
    pub data_type: DataType,
    pub data_n: u32,
    pub data: Option<Values>,
    pub error_type: DataType,
    pub error_model: i32,
    pub error_asymmetry: bool,
    pub error_params: Vec<f32>,
    pub errhi: Option<Values>,
    pub errlo: Option<Values>,
    pub errcode: i32,
    pub error_msg: String,
    pub source_status: i32,
    pub signal_status: i32,
    pub data_units: String,
    pub data_label: String,
    pub data_desc: String,
    pub dims: Vec<Dim>,
    pub opaque_type: OpaqueType,
    pub opaque_count: i32,
    /// Structured payload received through the structure codec.
    pub opaque: Option<Vec<u8>>,
    /// Client state in force when this block was received.
    pub client_block: ClientBlock,
    pub meta: Option<MetaData>,
    /// Error records attached to this block during result assembly.
    pub errors: Vec<ErrorRecord>,
}

impl DataBlock {
    pub fn new(data: Values) -> Self {
        Self {
            data_type: data.data_type(),
            data_n: data.len() as u32,
            data: Some(data),
            order: -1,
            source_status: DEFAULT_STATUS,
            signal_status: DEFAULT_STATUS,
            ..Self::default()
        }
    }

    pub fn with_dim(mut self, dim: Dim) -> Self {
        self.dims.push(dim);
        self.rank = self.dims.len() as u32;
        self
    }

    pub fn with_label(mut self, label: &str, units: &str) -> Self {
        self.data_label = label.to_string();
        self.data_units = units.to_string();
        self
    }

    /// Status to judge the data by: the signal's own status unless it was never set.
    pub fn effective_status(&self) -> i32 {
        if self.signal_status == DEFAULT_STATUS {
            self.source_status
        } else {
            self.signal_status
        }
    }

    /// True when the block carries an uncertainty section on the wire.
    pub fn has_errors_section(&self) -> bool {
        self.error_type != DataType::Unknown || !self.error_params.is_empty()
    }
}

/// A caller supplied array to be written to the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PutDataBlock {
    pub data_type: DataType,
    pub rank: u32,
    pub count: u32,
    pub shape: Vec<i32>,
    pub data: Option<Values>,
    pub opaque_type: OpaqueType,
    pub opaque_count: i32,
    pub opaque: Option<Vec<u8>>,
    pub block_name: String,
}

impl PutDataBlock {
    pub fn new(name: &str, data: Values) -> Self {
        let count = data.len() as u32;
        Self {
            data_type: data.data_type(),
            rank: 1,
            count,
            shape: vec![count as i32],
            data: Some(data),
            block_name: name.to_string(),
            ..Self::default()
        }
    }

    /// Build a block whose payload is marshalled by the structure codec.
    pub fn structured(name: &str, opaque_type: OpaqueType, payload: Vec<u8>) -> Self {
        Self {
            data_type: DataType::Compound,
            count: 1,
            opaque_type,
            opaque_count: 1,
            opaque: Some(payload),
            block_name: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct DataSystem {
    pub system_id: i32,
    pub version: i32,
    pub meta_id: i32,
    pub kind: String,
    pub device_name: String,
    pub system_name: String,
    pub system_desc: String,
    pub creation: String,
    pub xml: String,
    pub xml_creation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct SystemConfig {
    pub config_id: i32,
    pub system_id: i32,
    pub meta_id: i32,
    pub config_name: String,
    pub config_desc: String,
    pub creation: String,
    pub xml: String,
    pub xml_creation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct DataSource {
    pub source_id: i32,
    pub config_id: i32,
    pub reason_id: i32,
    pub run_id: i32,
    pub meta_id: i32,
    pub exp_number: i32,
    pub pass: i32,
    pub status: i32,
    pub status_reason_code: i32,
    pub status_impact_code: i32,
    pub access: String,
    pub reprocess: String,
    pub kind: String,
    pub source_alias: String,
    pub pass_date: String,
    pub archive: String,
    pub device_name: String,
    pub format: String,
    pub path: String,
    pub filename: String,
    pub server: String,
    pub userid: String,
    pub status_desc: String,
    pub creation: String,
    pub modified: String,
    pub xml: String,
    pub xml_creation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct Signal {
    pub source_id: i32,
    pub signal_desc_id: i32,
    pub meta_id: i32,
    pub status: i32,
    pub status_reason_code: i32,
    pub status_impact_code: i32,
    pub status_desc: String,
    pub access: String,
    pub reprocess: String,
    pub creation: String,
    pub modified: String,
    pub xml: String,
    pub xml_creation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct SignalDesc {
    pub signal_desc_id: i32,
    pub meta_id: i32,
    pub rank: i32,
    pub range_start: i32,
    pub range_stop: i32,
    pub kind: String,
    pub source_alias: String,
    pub signal_alias: String,
    pub signal_name: String,
    pub generic_name: String,
    pub description: String,
    pub signal_class: String,
    pub signal_owner: String,
    pub creation: String,
    pub modified: String,
    pub xml: String,
    pub xml_creation: String,
}

/// Database records describing where a result came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetaData {
    pub data_system: DataSystem,
    pub system_config: SystemConfig,
    pub data_source: DataSource,
    pub signal: Signal,
    pub signal_desc: SignalDesc,
}

/// A serialised object with an integrity hash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataObject {
    pub object_type: u16,
    pub hash_type: u16,
    pub md: Vec<u8>,
    pub object: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MIN_STATUS;

    #[test]
    fn status_falls_back_to_source() {
        let mut block = DataBlock::new(Values::Float(vec![1.0]));
        block.source_status = MIN_STATUS;
        assert_eq!(block.effective_status(), MIN_STATUS);

        block.signal_status = 3;
        assert_eq!(block.effective_status(), 3);
    }

    #[test]
    fn with_dim_tracks_rank() {
        let block = DataBlock::new(Values::Int(vec![1, 2]))
            .with_dim(Dim::new(Values::Double(vec![0.0, 1.0])));
        assert_eq!(block.rank, 1);
        assert_eq!(block.dims[0].dim_n, 2);
        assert!(!block.dims[0].is_compressed());
    }
}
