//! In-memory PLC for development and tests.
//!
//! Backs holding registers and coils with plain `Vec`s behind a `Mutex`.
//! Valve pulses are timed with `tokio::time::sleep` rather than real
//! hardware auto-close. This is a test double, not a simulator of ALD
//! process physics — the numeric fluctuation model the source project ships
//! is explicitly out of scope (spec.md §1 Non-goals).

use super::{decode_registers, encode_registers, AddressRange, CoilBlock, ParameterAddress, Plc, RegisterBlock};
use crate::config::ByteOrder;
use crate::error::{CoreError, CoreResult};
use crate::model::DataType;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const REGISTER_COUNT: usize = 4096;
const COIL_COUNT: usize = 4096;

pub struct SimulatedPlc {
    holding_registers: Mutex<Vec<u16>>,
    coils: Mutex<Vec<bool>>,
    connected: AtomicBool,
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self {
            holding_registers: Mutex::new(vec![0u16; REGISTER_COUNT]),
            coils: Mutex::new(vec![false; COIL_COUNT]),
            connected: AtomicBool::new(true),
        }
    }
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plc for SimulatedPlc {
    async fn read_parameter(&self, addr: u16, data_type: DataType) -> CoreResult<f64> {
        if !self.is_connected() {
            return Err(CoreError::PlcDisconnected);
        }
        let span = data_type.register_span() as usize;
        let regs = self
            .holding_registers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let start = addr as usize;
        let words = regs
            .get(start..start + span)
            .ok_or_else(|| CoreError::PlcReadFailed(format!("address {addr} out of range")))?;
        // The simulator only ever decodes what it encoded itself, so the
        // wire byte order it picks is arbitrary as long as it's consistent.
        Ok(decode_registers(data_type, words, ByteOrder::BigEndian))
    }

    async fn write_parameter(&self, addr: u16, data_type: DataType, value: f64) -> CoreResult<()> {
        if !self.is_connected() {
            return Err(CoreError::PlcDisconnected);
        }
        let words = encode_registers(data_type, value, ByteOrder::BigEndian);
        let mut regs = self
            .holding_registers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let start = addr as usize;
        if start + words.len() > regs.len() {
            return Err(CoreError::PlcWriteFailed(format!(
                "address {addr} out of range"
            )));
        }
        regs[start..start + words.len()].copy_from_slice(&words);
        Ok(())
    }

    async fn read_all_parameters(
        &self,
        params: &[ParameterAddress],
    ) -> CoreResult<HashMap<Uuid, f64>> {
        let mut out = HashMap::with_capacity(params.len());
        for p in params {
            out.insert(p.parameter_id, self.read_parameter(p.address, p.data_type).await?);
        }
        Ok(out)
    }

    async fn read_setpoint(&self, addr: u16, data_type: DataType) -> CoreResult<f64> {
        // The simulator has no distinct setpoint bank; setpoints and live
        // values share storage, matching a simulation-mode PLC with no
        // separate setpoint registers.
        self.read_parameter(addr, data_type).await
    }

    async fn read_all_setpoints(
        &self,
        params: &[ParameterAddress],
    ) -> CoreResult<HashMap<Uuid, f64>> {
        self.read_all_parameters(params).await
    }

    async fn control_valve(
        &self,
        number: u32,
        open: bool,
        duration_ms: Option<u64>,
    ) -> CoreResult<()> {
        if !self.is_connected() {
            return Err(CoreError::PlcDisconnected);
        }
        let coil_index = number as usize;
        {
            let mut coils = self.coils.lock().unwrap_or_else(|p| p.into_inner());
            if coil_index >= coils.len() {
                return Err(CoreError::PlcWriteFailed(format!(
                    "valve {number} out of range"
                )));
            }
            coils[coil_index] = open;
        }

        if open {
            if let Some(ms) = duration_ms {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let mut coils = self.coils.lock().unwrap_or_else(|p| p.into_inner());
                coils[coil_index] = false;
            }
        }
        Ok(())
    }

    async fn bulk_read_holding_registers(
        &self,
        ranges: &[AddressRange],
    ) -> CoreResult<Vec<RegisterBlock>> {
        if !self.is_connected() {
            return Err(CoreError::PlcDisconnected);
        }
        let regs = self
            .holding_registers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let mut blocks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let start = range.start as usize;
            let end = start + range.count as usize;
            let values = regs
                .get(start..end)
                .ok_or_else(|| {
                    CoreError::PlcReadFailed(format!("range {}..{} out of bounds", start, end))
                })?
                .to_vec();
            blocks.push(RegisterBlock { start: range.start, values });
        }
        Ok(blocks)
    }

    async fn bulk_read_coils(&self, ranges: &[AddressRange]) -> CoreResult<Vec<CoilBlock>> {
        if !self.is_connected() {
            return Err(CoreError::PlcDisconnected);
        }
        let coils = self.coils.lock().unwrap_or_else(|p| p.into_inner());
        let mut blocks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let start = range.start as usize;
            let end = start + range.count as usize;
            let values = coils
                .get(start..end)
                .ok_or_else(|| {
                    CoreError::PlcReadFailed(format!("range {}..{} out of bounds", start, end))
                })?
                .to_vec();
            blocks.push(CoilBlock { start: range.start, values });
        }
        Ok(blocks)
    }

    async fn write_holding_register(&self, address: u16, value: u16) -> CoreResult<()> {
        let mut regs = self
            .holding_registers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let idx = address as usize;
        *regs
            .get_mut(idx)
            .ok_or_else(|| CoreError::PlcWriteFailed(format!("address {address} out of range")))? =
            value;
        Ok(())
    }

    async fn write_coil(&self, address: u16, value: bool) -> CoreResult<()> {
        let mut coils = self.coils.lock().unwrap_or_else(|p| p.into_inner());
        let idx = address as usize;
        *coils
            .get_mut(idx)
            .ok_or_else(|| CoreError::PlcWriteFailed(format!("address {address} out of range")))? =
            value;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> CoreResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips_float() {
        let plc = SimulatedPlc::new();
        plc.write_parameter(10, DataType::Float, 42.5).await.unwrap();
        let value = plc.read_parameter(10, DataType::Float).await.unwrap();
        assert!((value - 42.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn valve_pulse_auto_closes_after_duration() {
        let plc = SimulatedPlc::new();
        plc.control_valve(1, true, Some(10)).await.unwrap();
        let coils = plc.coils.lock().unwrap();
        assert!(!coils[1]);
    }

    #[tokio::test]
    async fn disconnected_plc_rejects_reads() {
        let plc = SimulatedPlc::new();
        plc.disconnect().await.unwrap();
        assert!(!plc.is_connected());
        let result = plc.read_parameter(0, DataType::Int16).await;
        assert!(matches!(result, Err(CoreError::PlcDisconnected)));
    }

    #[tokio::test]
    async fn bulk_read_holding_registers_matches_individual_writes() {
        let plc = SimulatedPlc::new();
        plc.write_holding_register(100, 7).await.unwrap();
        plc.write_holding_register(101, 9).await.unwrap();
        let ranges = vec![AddressRange { start: 100, count: 2, parameter_ids: vec![] }];
        let blocks = plc.bulk_read_holding_registers(&ranges).await.unwrap();
        assert_eq!(blocks[0].values, vec![7, 9]);
    }
}
