//! PLC (fieldbus) collaborator trait.
//!
//! The PLC wire driver is treated as an external collaborator
//! (spec.md §1, §6) with a fixed surface: scalar parameter read/write, bulk
//! reads for the continuous logger, setpoint read-back, and direct valve
//! control. `Plc` captures exactly that surface. Two implementors are
//! provided: [`simulated::SimulatedPlc`] (in-memory, no real hardware — used
//! in tests and for development) and [`modbus::ModbusPlc`] (real Modbus TCP
//! hardware via `tokio-modbus`). The simulator's numeric fluctuation model
//! is explicitly out of scope (spec.md §1 Non-goals); `SimulatedPlc` only
//! needs to behave plausibly enough to exercise the runtime end to end.

pub mod modbus;
pub mod simulated;

use crate::config::ByteOrder;
use crate::error::CoreResult;
use crate::model::{DataType, ReadType};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

/// Encodes a value into its on-wire register representation. Shared by every
/// `Plc` implementor so the byte layout (Float/Int32 as two words, Int16/
/// Binary as one word) never drifts between them. `byte_order` only affects
/// the two-word types: `BigEndian` writes the high word first, `LittleEndian`
/// the low word first (per `PlcSettings::byte_order`, spec §6).
pub fn encode_registers(data_type: DataType, value: f64, byte_order: ByteOrder) -> Vec<u16> {
    match data_type {
        DataType::Float => {
            let bits = (value as f32).to_bits();
            order_words((bits >> 16) as u16, bits as u16, byte_order)
        }
        DataType::Int32 => {
            let bits = value as i32 as u32;
            order_words((bits >> 16) as u16, bits as u16, byte_order)
        }
        DataType::Int16 => vec![value as i16 as u16],
        DataType::Binary => vec![if value != 0.0 { 1 } else { 0 }],
    }
}

/// Inverse of [`encode_registers`]. `words` must hold at least
/// `data_type.register_span()` entries.
pub fn decode_registers(data_type: DataType, words: &[u16], byte_order: ByteOrder) -> f64 {
    match data_type {
        DataType::Float => {
            let bits = words_to_u32(words, byte_order);
            f32::from_bits(bits) as f64
        }
        DataType::Int32 => {
            let bits = words_to_u32(words, byte_order);
            bits as i32 as f64
        }
        DataType::Int16 => words[0] as i16 as f64,
        DataType::Binary => {
            if words[0] != 0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn order_words(high: u16, low: u16, byte_order: ByteOrder) -> Vec<u16> {
    match byte_order {
        ByteOrder::BigEndian => vec![high, low],
        ByteOrder::LittleEndian => vec![low, high],
    }
}

fn words_to_u32(words: &[u16], byte_order: ByteOrder) -> u32 {
    let (high, low) = match byte_order {
        ByteOrder::BigEndian => (words[0], words.get(1).copied().unwrap_or(0)),
        ByteOrder::LittleEndian => (words.get(1).copied().unwrap_or(0), words[0]),
    };
    ((high as u32) << 16) | low as u32
}

/// Decodes one bulk-read block into per-parameter values, walking
/// `range.parameter_ids` in address order and advancing by each parameter's
/// `register_span`. Used by the continuous logger after
/// [`group_by_read_type_and_address`] + `bulk_read_holding_registers`/
/// `bulk_read_coils`.
pub fn decode_register_block(
    range: &AddressRange,
    block: &RegisterBlock,
    by_id: &HashMap<Uuid, ParameterAddress>,
    byte_order: ByteOrder,
    out: &mut HashMap<Uuid, f64>,
) {
    let mut offset = 0usize;
    for parameter_id in &range.parameter_ids {
        let Some(addr) = by_id.get(parameter_id) else { continue };
        let span = addr.data_type.register_span() as usize;
        if let Some(words) = block.values.get(offset..offset + span) {
            out.insert(*parameter_id, decode_registers(addr.data_type, words, byte_order));
        }
        offset += span;
    }
}

/// Decodes one bulk-read coil block into per-parameter values. Coils are
/// always single-bit (`Binary`), so there is no multi-word span to walk.
pub fn decode_coil_block(
    range: &AddressRange,
    block: &CoilBlock,
    by_id: &HashMap<Uuid, ParameterAddress>,
    out: &mut HashMap<Uuid, f64>,
) {
    for (offset, parameter_id) in range.parameter_ids.iter().enumerate() {
        if by_id.contains_key(parameter_id) {
            if let Some(&bit) = block.values.get(offset) {
                out.insert(*parameter_id, if bit { 1.0 } else { 0.0 });
            }
        }
    }
}

/// One Modbus holding/coil address, paired with the data type stored there.
#[derive(Debug, Clone, Copy)]
pub struct ParameterAddress {
    pub parameter_id: Uuid,
    pub address: u16,
    pub data_type: DataType,
}

/// A contiguous run of addresses of the same read type, produced by the
/// continuous logger's grouping pass (spec §4.F).
#[derive(Debug, Clone)]
pub struct AddressRange {
    pub start: u16,
    /// Total register/coil count spanned (sum of each member's `register_span`).
    pub count: u16,
    pub parameter_ids: Vec<Uuid>,
}

/// Decoded values for one bulk-read address range.
#[derive(Debug, Clone)]
pub struct RegisterBlock {
    pub start: u16,
    pub values: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct CoilBlock {
    pub start: u16,
    pub values: Vec<bool>,
}

#[async_trait]
pub trait Plc: Send + Sync {
    async fn read_parameter(&self, addr: u16, data_type: DataType) -> CoreResult<f64>;
    async fn write_parameter(&self, addr: u16, data_type: DataType, value: f64) -> CoreResult<()>;
    async fn read_all_parameters(
        &self,
        params: &[ParameterAddress],
    ) -> CoreResult<HashMap<Uuid, f64>>;
    async fn read_setpoint(&self, addr: u16, data_type: DataType) -> CoreResult<f64>;
    async fn read_all_setpoints(
        &self,
        params: &[ParameterAddress],
    ) -> CoreResult<HashMap<Uuid, f64>>;
    /// Drives valve `number` open for `duration_ms`, if given; the PLC times
    /// the pulse and auto-closes the valve. `duration_ms = None` is a bare
    /// on/off command with no auto-close.
    async fn control_valve(
        &self,
        number: u32,
        open: bool,
        duration_ms: Option<u64>,
    ) -> CoreResult<()>;
    async fn bulk_read_holding_registers(
        &self,
        ranges: &[AddressRange],
    ) -> CoreResult<Vec<RegisterBlock>>;
    async fn bulk_read_coils(&self, ranges: &[AddressRange]) -> CoreResult<Vec<CoilBlock>>;
    async fn write_holding_register(&self, address: u16, value: u16) -> CoreResult<()>;
    async fn write_coil(&self, address: u16, value: bool) -> CoreResult<()>;
    fn is_connected(&self) -> bool;
    async fn initialize(&self) -> CoreResult<()>;
    async fn disconnect(&self) -> CoreResult<()>;
}

/// Splits `params` into one bucket per [`ReadType`], each internally grouped
/// into contiguous-address runs, per the continuous logger's bulk-read
/// algorithm (spec §4.F). Grounded on
/// `original_source/src/performance/high_performance_parameter_logger.py`'s
/// `BulkParameterReader.group_parameters_by_type_and_address`: sort by
/// address, start a new group whenever the address is non-contiguous with
/// the previous member or the read type changes.
pub fn group_by_read_type_and_address(
    params: &[ParameterAddress],
) -> HashMap<ReadType, Vec<AddressRange>> {
    let mut by_type: HashMap<ReadType, Vec<ParameterAddress>> = HashMap::new();
    for param in params {
        by_type
            .entry(param.data_type.infer_read_type())
            .or_default()
            .push(*param);
    }

    by_type
        .into_iter()
        .map(|(read_type, members)| (read_type, group_contiguous(members)))
        .collect()
}

fn group_contiguous(mut params: Vec<ParameterAddress>) -> Vec<AddressRange> {
    params.sort_by_key(|p| p.address);

    let mut ranges: Vec<AddressRange> = Vec::new();
    for param in params {
        let span = param.data_type.register_span();

        if let Some(last) = ranges.last_mut() {
            if last.start + last.count == param.address {
                last.count += span;
                last.parameter_ids.push(param.parameter_id);
                continue;
            }
        }

        ranges.push(AddressRange {
            start: param.address,
            count: span,
            parameter_ids: vec![param.parameter_id],
        });
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;

    #[test]
    fn contiguous_float_params_form_one_range() {
        let params = vec![
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 100, data_type: DataType::Float },
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 102, data_type: DataType::Float },
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 104, data_type: DataType::Float },
        ];
        let grouped = group_by_read_type_and_address(&params);
        let ranges = &grouped[&ReadType::Holding];
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 100);
        assert_eq!(ranges[0].count, 6);
        assert_eq!(ranges[0].parameter_ids.len(), 3);
    }

    #[test]
    fn gap_in_addresses_breaks_the_group() {
        let params = vec![
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 100, data_type: DataType::Int16 },
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 105, data_type: DataType::Int16 },
        ];
        let grouped = group_by_read_type_and_address(&params);
        assert_eq!(grouped[&ReadType::Holding].len(), 2);
    }

    #[test]
    fn unordered_input_is_sorted_before_grouping() {
        let params = vec![
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 102, data_type: DataType::Int16 },
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 100, data_type: DataType::Int16 },
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 101, data_type: DataType::Int16 },
        ];
        let grouped = group_by_read_type_and_address(&params);
        let ranges = &grouped[&ReadType::Holding];
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 100);
        assert_eq!(ranges[0].count, 3);
    }

    #[test]
    fn binary_and_numeric_params_separate_into_different_buckets() {
        let params = vec![
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 0, data_type: DataType::Binary },
            ParameterAddress { parameter_id: Uuid::new_v4(), address: 100, data_type: DataType::Float },
        ];
        let grouped = group_by_read_type_and_address(&params);
        assert_eq!(grouped[&ReadType::Coil].len(), 1);
        assert_eq!(grouped[&ReadType::Holding].len(), 1);
    }
}
