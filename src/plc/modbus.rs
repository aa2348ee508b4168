//! Modbus TCP PLC implementation.
//!
//! Talks to real hardware via `tokio-modbus`. A single shared connection is
//! serialized behind an async `Mutex` per spec §5's shared-resource policy
//! ("the PLC driver is responsible for serializing concurrent calls").

use super::{decode_registers, encode_registers, AddressRange, CoilBlock, ParameterAddress, Plc, RegisterBlock};
use crate::config::PlcSettings;
use crate::error::{CoreError, CoreResult};
use crate::model::DataType;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_modbus::client::{tcp, Context as ModbusContext};
use tokio_modbus::prelude::*;
use uuid::Uuid;

pub struct ModbusPlc {
    settings: PlcSettings,
    context: Mutex<Option<ModbusContext>>,
    connected: AtomicBool,
}

impl ModbusPlc {
    pub fn new(settings: PlcSettings) -> Self {
        Self {
            settings,
            context: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

}

#[async_trait]
impl Plc for ModbusPlc {
    async fn read_parameter(&self, addr: u16, data_type: DataType) -> CoreResult<f64> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or(CoreError::PlcDisconnected)?;
        let words = ctx
            .read_holding_registers(addr, data_type.register_span())
            .await
            .map_err(|e| CoreError::PlcReadFailed(e.to_string()))?
            .map_err(|e| CoreError::PlcReadFailed(e.to_string()))?;
        Ok(decode_registers(data_type, &words, self.settings.byte_order))
    }

    async fn write_parameter(&self, addr: u16, data_type: DataType, value: f64) -> CoreResult<()> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or(CoreError::PlcDisconnected)?;
        let words = encode_registers(data_type, value, self.settings.byte_order);
        ctx.write_multiple_registers(addr, &words)
            .await
            .map_err(|e| CoreError::PlcWriteFailed(e.to_string()))?
            .map_err(|e| CoreError::PlcWriteFailed(e.to_string()))?;
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
        // Setpoints live in a parallel holding-register bank offset by the
        // same span as the live-value bank on this PLC's register map.
        let setpoint_addr = addr.wrapping_add(data_type.register_span());
        self.read_parameter(setpoint_addr, data_type).await
    }

    async fn read_all_setpoints(
        &self,
        params: &[ParameterAddress],
    ) -> CoreResult<HashMap<Uuid, f64>> {
        let mut out = HashMap::with_capacity(params.len());
        for p in params {
            out.insert(p.parameter_id, self.read_setpoint(p.address, p.data_type).await?);
        }
        Ok(out)
    }

    async fn control_valve(
        &self,
        number: u32,
        open: bool,
        duration_ms: Option<u64>,
    ) -> CoreResult<()> {
        let coil = number as u16;
        self.write_coil(coil, open).await?;
        if open {
            if let Some(ms) = duration_ms {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                self.write_coil(coil, false).await?;
            }
        }
        Ok(())
    }

    async fn bulk_read_holding_registers(
        &self,
        ranges: &[AddressRange],
    ) -> CoreResult<Vec<RegisterBlock>> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or(CoreError::PlcDisconnected)?;
        let mut blocks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let values = ctx
                .read_holding_registers(range.start, range.count)
                .await
                .map_err(|e| CoreError::PlcReadFailed(e.to_string()))?
                .map_err(|e| CoreError::PlcReadFailed(e.to_string()))?;
            blocks.push(RegisterBlock { start: range.start, values });
        }
        Ok(blocks)
    }

    async fn bulk_read_coils(&self, ranges: &[AddressRange]) -> CoreResult<Vec<CoilBlock>> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or(CoreError::PlcDisconnected)?;
        let mut blocks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let values = ctx
                .read_coils(range.start, range.count)
                .await
                .map_err(|e| CoreError::PlcReadFailed(e.to_string()))?
                .map_err(|e| CoreError::PlcReadFailed(e.to_string()))?;
            blocks.push(CoilBlock { start: range.start, values });
        }
        Ok(blocks)
    }

    async fn write_holding_register(&self, address: u16, value: u16) -> CoreResult<()> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or(CoreError::PlcDisconnected)?;
        ctx.write_single_register(address, value)
            .await
            .map_err(|e| CoreError::PlcWriteFailed(e.to_string()))?
            .map_err(|e| CoreError::PlcWriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn write_coil(&self, address: u16, value: bool) -> CoreResult<()> {
        let mut guard = self.context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or(CoreError::PlcDisconnected)?;
        ctx.write_single_coil(address, value)
            .await
            .map_err(|e| CoreError::PlcWriteFailed(e.to_string()))?
            .map_err(|e| CoreError::PlcWriteFailed(e.to_string()))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> CoreResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.settings.host, self.settings.port)
            .parse()
            .map_err(|e| CoreError::ValidationError(format!("invalid plc address: {e}")))?;
        let ctx = tcp::connect_slave(addr, Slave(self.settings.slave_id))
            .await
            .map_err(|e| CoreError::PlcReadFailed(format!("connect failed: {e}")))?;
        *self.context.lock().await = Some(ctx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        *self.context.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
