//! Continuous Parameter Logger (spec §4.F).
//!
//! A fixed-cadence (`T` = `LoggerSettings::period_ms`, default 1s) bulk-read
//! loop, independent of whether a recipe is running. Every tick: snapshot
//! the parameter table, group addresses into contiguous runs and issue bulk
//! PLC reads, read and reconcile setpoints, then write the resulting
//! data points to the global history stream (always) and the per-process
//! stream (only while a process is active). Grounded on
//! `original_source/src/performance/high_performance_parameter_logger.py`'s
//! `HighPerformanceParameterLogger`: the rolling per-cycle metrics window
//! this module keeps replaces that file's standalone SLA-monitor task,
//! which is not reimplemented separately (spec §4.F supplement).
//!
//! Timing contract: a tick that overruns `T` is never followed by a
//! catch-up burst. The loop sleeps `T - elapsed` when a tick finishes early
//! and otherwise starts the next tick immediately — no attempt is made to
//! run extra ticks to make up for lost time.

use crate::cache::ParameterCache;
use crate::config::{ByteOrder, LoggerSettings};
use crate::datastore::Datastore;
use crate::error::CoreResult;
use crate::executor::RecordOnce;
use crate::model::{MachineStatus, Parameter, ParameterDataPoint, ReadType};
use crate::plc::{
    decode_coil_block, decode_register_block, group_by_read_type_and_address, ParameterAddress,
    Plc,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, warn};
use uuid::Uuid;

const METRICS_WINDOW: usize = 300;

/// One tick's timing and outcome, kept in a rolling window for
/// observability. Exposed read-only via [`ContinuousParameterLogger::snapshot_metrics`].
#[derive(Debug, Clone, Copy)]
pub struct CycleMetrics {
    pub timestamp: DateTime<Utc>,
    pub plc_read_ms: u64,
    pub db_write_ms: u64,
    pub total_cycle_ms: u64,
    /// `total_cycle_ms - period_ms`; positive means the cycle ran long.
    pub jitter_ms: i64,
    pub parameter_count: usize,
    pub had_error: bool,
}

/// Which stream(s) a tick writes to: always the global history, and
/// additionally the per-process stream while a recipe is running.
enum LoggerMode {
    Idle,
    Processing(Uuid),
}

impl LoggerMode {
    fn process_id(&self) -> Option<Uuid> {
        match self {
            LoggerMode::Idle => None,
            LoggerMode::Processing(id) => Some(*id),
        }
    }
}

pub struct ContinuousParameterLogger {
    datastore: Arc<dyn Datastore>,
    plc: Arc<dyn Plc>,
    cache: Arc<ParameterCache>,
    machine_id: Uuid,
    settings: LoggerSettings,
    byte_order: ByteOrder,
    metrics: Mutex<VecDeque<CycleMetrics>>,
    consecutive_errors: Mutex<u32>,
}

impl ContinuousParameterLogger {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        plc: Arc<dyn Plc>,
        cache: Arc<ParameterCache>,
        machine_id: Uuid,
        settings: LoggerSettings,
        byte_order: ByteOrder,
    ) -> Self {
        Self {
            datastore,
            plc,
            cache,
            machine_id,
            settings,
            byte_order,
            metrics: Mutex::new(VecDeque::with_capacity(METRICS_WINDOW)),
            consecutive_errors: Mutex::new(0),
        }
    }

    /// Runs forever at the configured cadence. Never returns; tick failures
    /// are logged and counted toward the consecutive-error backoff rather
    /// than aborting the loop.
    pub async fn run_forever(&self) -> ! {
        let period = Duration::from_millis(self.settings.period_ms);
        loop {
            let tick_start = Instant::now();
            let metrics = self.run_once().await;
            self.record_metrics(metrics);

            let elapsed = tick_start.elapsed();
            if elapsed < period {
                tokio::time::sleep(period - elapsed).await;
            }
        }
    }

    /// One tick, exposed directly for tests. Never panics or propagates an
    /// error — failures are captured in the returned [`CycleMetrics`].
    pub async fn run_once(&self) -> CycleMetrics {
        let tick_start = Instant::now();
        let result = self.tick().await;
        let total_cycle_ms = tick_start.elapsed().as_millis() as u64;
        let jitter_ms = total_cycle_ms as i64 - self.settings.period_ms as i64;

        match result {
            Ok((plc_read_ms, db_write_ms, parameter_count)) => {
                *self.consecutive_errors.lock().unwrap_or_else(|e| e.into_inner()) = 0;
                CycleMetrics {
                    timestamp: Utc::now(),
                    plc_read_ms,
                    db_write_ms,
                    total_cycle_ms,
                    jitter_ms,
                    parameter_count,
                    had_error: false,
                }
            }
            Err(e) => {
                error!(machine_id = %self.machine_id, error = %e, "continuous logger tick failed");
                let consecutive = {
                    let mut guard = self.consecutive_errors.lock().unwrap_or_else(|e| e.into_inner());
                    *guard += 1;
                    *guard
                };
                if consecutive >= self.settings.consecutive_error_limit {
                    warn!(
                        machine_id = %self.machine_id,
                        consecutive,
                        "continuous logger backing off after repeated tick failures"
                    );
                    tokio::time::sleep(Duration::from_secs(self.settings.backoff_secs)).await;
                }
                CycleMetrics {
                    timestamp: Utc::now(),
                    plc_read_ms: 0,
                    db_write_ms: 0,
                    total_cycle_ms,
                    jitter_ms,
                    parameter_count: 0,
                    had_error: true,
                }
            }
        }
    }

    fn record_metrics(&self, metrics: CycleMetrics) {
        if metrics.jitter_ms > self.settings.jitter_alert_ms as i64 {
            warn!(
                machine_id = %self.machine_id,
                jitter_ms = metrics.jitter_ms,
                "continuous logger cycle exceeded jitter alert threshold"
            );
        } else if metrics.jitter_ms > self.settings.jitter_tolerance_ms as i64 {
            warn!(
                machine_id = %self.machine_id,
                jitter_ms = metrics.jitter_ms,
                "continuous logger cycle ran past jitter tolerance"
            );
        }

        let mut window = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() >= METRICS_WINDOW {
            window.pop_front();
        }
        window.push_back(metrics);
    }

    /// Read-only snapshot of the rolling metrics window, oldest first.
    pub fn snapshot_metrics(&self) -> Vec<CycleMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).iter().copied().collect()
    }

    async fn determine_mode(&self) -> CoreResult<LoggerMode> {
        let machine = self.datastore.get_machine(self.machine_id).await?;
        Ok(match (machine.status, machine.current_process_id) {
            (MachineStatus::Processing, Some(process_id)) => LoggerMode::Processing(process_id),
            _ => LoggerMode::Idle,
        })
    }

    async fn tick(&self) -> CoreResult<(u64, u64, usize)> {
        let mode = self.determine_mode().await?;
        let parameters = self.cache.snapshot_all(self.datastore.as_ref()).await?;

        let plc_start = Instant::now();
        let values = self.bulk_read_values(&parameters).await?;
        let setpoints = self.read_and_reconcile_setpoints(&parameters).await?;
        let plc_read_ms = plc_start.elapsed().as_millis() as u64;

        let now = Utc::now();
        let points: Vec<ParameterDataPoint> = parameters
            .iter()
            .filter_map(|p| {
                values.get(&p.parameter_id).map(|&value| ParameterDataPoint {
                    parameter_id: p.parameter_id,
                    value,
                    set_point: setpoints.get(&p.parameter_id).copied(),
                    timestamp: now,
                    process_id: mode.process_id(),
                })
            })
            .collect();

        let db_start = Instant::now();
        self.write_points(&points, &mode).await?;
        let db_write_ms = db_start.elapsed().as_millis() as u64;

        Ok((plc_read_ms, db_write_ms, points.len()))
    }

    fn read_addresses(parameters: &[Parameter]) -> Vec<ParameterAddress> {
        parameters
            .iter()
            .filter_map(|p| {
                p.read_modbus_address.map(|address| ParameterAddress {
                    parameter_id: p.parameter_id,
                    address,
                    data_type: p.data_type,
                })
            })
            .collect()
    }

    /// Groups `parameters`' read addresses into contiguous runs per read
    /// type, issues one bulk read per run, and decodes the results —
    /// spec §4.F's "grouped into contiguous-address runs ... issue bulk
    /// reads to the PLC and decode" step, built directly on
    /// [`group_by_read_type_and_address`]. A group whose bulk read fails
    /// falls back to reading its members individually rather than failing
    /// the whole tick (spec §4.F step 2, §5), grounded on
    /// `high_performance_parameter_logger.py`'s `_fallback_individual_reads`.
    async fn bulk_read_values(&self, parameters: &[Parameter]) -> CoreResult<HashMap<Uuid, f64>> {
        let addresses = Self::read_addresses(parameters);
        let by_id: HashMap<Uuid, ParameterAddress> =
            addresses.iter().map(|a| (a.parameter_id, *a)).collect();
        let grouped = group_by_read_type_and_address(&addresses);
        let mut out = HashMap::with_capacity(addresses.len());

        if let Some(ranges) = grouped.get(&ReadType::Holding) {
            match self.plc.bulk_read_holding_registers(ranges).await {
                Ok(blocks) => {
                    for (range, block) in ranges.iter().zip(blocks.iter()) {
                        decode_register_block(range, block, &by_id, self.byte_order, &mut out);
                    }
                }
                Err(e) => {
                    warn!(
                        machine_id = %self.machine_id,
                        error = %e,
                        "bulk holding-register read failed, falling back to individual reads"
                    );
                    let members = Self::range_members(ranges, &by_id);
                    out.extend(self.fallback_individual_reads(&members).await);
                }
            }
        }
        if let Some(ranges) = grouped.get(&ReadType::Coil) {
            match self.plc.bulk_read_coils(ranges).await {
                Ok(blocks) => {
                    for (range, block) in ranges.iter().zip(blocks.iter()) {
                        decode_coil_block(range, block, &by_id, &mut out);
                    }
                }
                Err(e) => {
                    warn!(
                        machine_id = %self.machine_id,
                        error = %e,
                        "bulk coil read failed, falling back to individual reads"
                    );
                    let members = Self::range_members(ranges, &by_id);
                    out.extend(self.fallback_individual_reads(&members).await);
                }
            }
        }

        Ok(out)
    }

    fn range_members(
        ranges: &[crate::plc::AddressRange],
        by_id: &HashMap<Uuid, ParameterAddress>,
    ) -> Vec<ParameterAddress> {
        ranges
            .iter()
            .flat_map(|range| range.parameter_ids.iter().filter_map(|id| by_id.get(id).copied()))
            .collect()
    }

    /// Reads each of `addresses` individually, `max_workers` at a time, and
    /// returns whatever succeeds. A parameter whose individual read also
    /// fails is logged and simply absent from the result, matching the
    /// original source's fallback (a missing value is skipped, not fatal).
    async fn fallback_individual_reads(
        &self,
        addresses: &[ParameterAddress],
    ) -> HashMap<Uuid, f64> {
        let mut out = HashMap::with_capacity(addresses.len());
        for chunk in addresses.chunks(self.settings.max_workers.max(1)) {
            let reads = chunk.iter().map(|addr| async move {
                let value = self.plc.read_parameter(addr.address, addr.data_type).await;
                (addr.parameter_id, value)
            });
            for (parameter_id, result) in join_all(reads).await {
                match result {
                    Ok(value) => {
                        out.insert(parameter_id, value);
                    }
                    Err(e) => {
                        warn!(
                            machine_id = %self.machine_id,
                            parameter_id = %parameter_id,
                            error = %e,
                            "fallback individual read failed"
                        );
                    }
                }
            }
        }
        out
    }

    /// Reads every parameter's setpoint bank and reconciles it against the
    /// cached `set_value`: when the PLC's setpoint differs from what this
    /// runtime last wrote by more than a small epsilon, the PLC's value is
    /// authoritative (an operator may have adjusted it directly at the
    /// panel) and is written back to the datastore and cache.
    async fn read_and_reconcile_setpoints(
        &self,
        parameters: &[Parameter],
    ) -> CoreResult<HashMap<Uuid, f64>> {
        const RECONCILE_EPSILON: f64 = 1e-6;

        let addresses = Self::read_addresses(parameters);
        let setpoints = self.plc.read_all_setpoints(&addresses).await?;

        for parameter in parameters {
            if let Some(&plc_setpoint) = setpoints.get(&parameter.parameter_id) {
                let drifted = match parameter.set_value {
                    Some(cached) => (cached - plc_setpoint).abs() > RECONCILE_EPSILON,
                    None => true,
                };
                if drifted {
                    self.datastore
                        .update_parameter_set_value(parameter.parameter_id, plc_setpoint)
                        .await?;
                    let mut reconciled = parameter.clone();
                    reconciled.set_value = Some(plc_setpoint);
                    self.cache.put(reconciled);
                }
            }
        }

        Ok(setpoints)
    }

    async fn write_points(&self, points: &[ParameterDataPoint], mode: &LoggerMode) -> CoreResult<()> {
        for batch in points.chunks(self.settings.write_batch_size.max(1)) {
            self.datastore.insert_global_data_points(batch).await?;
            if matches!(mode, LoggerMode::Processing(_)) {
                self.datastore.insert_process_data_points(batch).await?;
            }
        }
        Ok(())
    }
}

/// Lets the executor snapshot one data point into the per-process stream
/// immediately after a step completes (spec §4.D step 5), rather than
/// waiting for the next fixed-cadence tick.
#[async_trait]
impl RecordOnce for ContinuousParameterLogger {
    async fn record_once(&self, process_id: Uuid) -> CoreResult<()> {
        let parameters = self.cache.snapshot_all(self.datastore.as_ref()).await?;
        let values = self.bulk_read_values(&parameters).await?;
        let setpoints = self.read_and_reconcile_setpoints(&parameters).await?;

        let now = Utc::now();
        let points: Vec<ParameterDataPoint> = parameters
            .iter()
            .filter_map(|p| {
                values.get(&p.parameter_id).map(|&value| ParameterDataPoint {
                    parameter_id: p.parameter_id,
                    value,
                    set_point: setpoints.get(&p.parameter_id).copied(),
                    timestamp: now,
                    process_id: Some(process_id),
                })
            })
            .collect();

        self.datastore.insert_process_data_points(&points).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemoryDatastore;
    use crate::model::{DataType, Machine, MachineState};
    use crate::plc::simulated::SimulatedPlc;
    use crate::plc::{AddressRange, CoilBlock, RegisterBlock};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wraps a [`SimulatedPlc`] but fails its first bulk holding-register
    /// read, so tests can exercise the per-group fallback path without a
    /// real Modbus error.
    struct FailingBulkPlc {
        inner: SimulatedPlc,
        bulk_failed_once: AtomicBool,
    }

    impl FailingBulkPlc {
        fn new() -> Self {
            Self { inner: SimulatedPlc::new(), bulk_failed_once: AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl Plc for FailingBulkPlc {
        async fn read_parameter(&self, addr: u16, data_type: DataType) -> CoreResult<f64> {
            self.inner.read_parameter(addr, data_type).await
        }
        async fn write_parameter(&self, addr: u16, data_type: DataType, value: f64) -> CoreResult<()> {
            self.inner.write_parameter(addr, data_type, value).await
        }
        async fn read_all_parameters(
            &self,
            params: &[ParameterAddress],
        ) -> CoreResult<HashMap<Uuid, f64>> {
            self.inner.read_all_parameters(params).await
        }
        async fn read_setpoint(&self, addr: u16, data_type: DataType) -> CoreResult<f64> {
            self.inner.read_setpoint(addr, data_type).await
        }
        async fn read_all_setpoints(
            &self,
            params: &[ParameterAddress],
        ) -> CoreResult<HashMap<Uuid, f64>> {
            self.inner.read_all_setpoints(params).await
        }
        async fn control_valve(
            &self,
            number: u32,
            open: bool,
            duration_ms: Option<u64>,
        ) -> CoreResult<()> {
            self.inner.control_valve(number, open, duration_ms).await
        }
        async fn bulk_read_holding_registers(
            &self,
            ranges: &[AddressRange],
        ) -> CoreResult<Vec<RegisterBlock>> {
            if !self.bulk_failed_once.swap(true, Ordering::SeqCst) {
                return Err(crate::error::CoreError::PlcReadFailed(
                    "simulated bulk read fault".to_string(),
                ));
            }
            self.inner.bulk_read_holding_registers(ranges).await
        }
        async fn bulk_read_coils(&self, ranges: &[AddressRange]) -> CoreResult<Vec<CoilBlock>> {
            self.inner.bulk_read_coils(ranges).await
        }
        async fn write_holding_register(&self, address: u16, value: u16) -> CoreResult<()> {
            self.inner.write_holding_register(address, value).await
        }
        async fn write_coil(&self, address: u16, value: bool) -> CoreResult<()> {
            self.inner.write_coil(address, value).await
        }
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
        async fn initialize(&self) -> CoreResult<()> {
            self.inner.initialize().await
        }
        async fn disconnect(&self) -> CoreResult<()> {
            self.inner.disconnect().await
        }
    }

    fn idle_machine() -> (Uuid, Machine, MachineState) {
        let id = Uuid::new_v4();
        (
            id,
            Machine { machine_id: id, status: MachineStatus::Idle, current_process_id: None, current_operator_id: None },
            MachineState { machine_id: id, current_state: MachineStatus::Idle, process_id: None, is_failure_mode: false, failure_description: None },
        )
    }

    fn seeded_parameter(ds: &MemoryDatastore, address: u16) -> Parameter {
        let parameter = Parameter {
            parameter_id: Uuid::new_v4(),
            name: format!("param_{address}"),
            min_value: 0.0,
            max_value: 1000.0,
            current_value: None,
            set_value: None,
            read_modbus_address: Some(address),
            write_modbus_address: Some(address),
            data_type: DataType::Float,
        };
        ds.seed_parameter(parameter.clone());
        parameter
    }

    fn logger_with(ds: Arc<MemoryDatastore>, plc: Arc<SimulatedPlc>) -> ContinuousParameterLogger {
        let (machine_id, machine, state) = idle_machine();
        ds.seed_machine(machine, state);
        let cache = Arc::new(ParameterCache::default());
        ContinuousParameterLogger::new(
            ds,
            plc,
            cache,
            machine_id,
            LoggerSettings::default(),
            ByteOrder::BigEndian,
        )
    }

    #[tokio::test]
    async fn tick_writes_global_points_but_not_process_points_when_idle() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = Arc::new(SimulatedPlc::new());
        let parameter = seeded_parameter(&ds, 100);
        plc.write_parameter(100, DataType::Float, 42.0).await.unwrap();

        let logger = logger_with(ds.clone(), plc);
        let metrics = logger.run_once().await;
        assert!(!metrics.had_error);
        assert_eq!(metrics.parameter_count, 1);

        let global = ds.global_points();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].parameter_id, parameter.parameter_id);
        assert!((global[0].value - 42.0).abs() < 0.1);
        assert!(ds.process_points().is_empty());
    }

    #[tokio::test]
    async fn tick_also_writes_process_points_while_processing() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = Arc::new(SimulatedPlc::new());
        seeded_parameter(&ds, 100);
        plc.write_parameter(100, DataType::Float, 10.0).await.unwrap();

        let (machine_id, mut machine, mut state) = idle_machine();
        let process_id = Uuid::new_v4();
        machine.status = MachineStatus::Processing;
        machine.current_process_id = Some(process_id);
        state.current_state = MachineStatus::Processing;
        state.process_id = Some(process_id);
        ds.seed_machine(machine, state);

        let cache = Arc::new(ParameterCache::default());
        let logger = ContinuousParameterLogger::new(
            ds.clone(),
            plc,
            cache,
            machine_id,
            LoggerSettings::default(),
            ByteOrder::BigEndian,
        );

        logger.run_once().await;
        assert_eq!(ds.process_points().len(), 1);
        assert_eq!(ds.process_points()[0].process_id, Some(process_id));
    }

    #[tokio::test]
    async fn setpoint_drift_is_reconciled_back_to_datastore() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = Arc::new(SimulatedPlc::new());
        let parameter = seeded_parameter(&ds, 200);
        // Simulated PLC shares live-value and setpoint storage, so writing
        // the live register is enough to exercise reconciliation.
        plc.write_parameter(200, DataType::Float, 77.0).await.unwrap();

        let logger = logger_with(ds.clone(), plc);
        logger.run_once().await;

        let stored = ds.get_parameter(parameter.parameter_id).await.unwrap();
        assert!((stored.set_value.unwrap() - 77.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn metrics_window_caps_at_300_entries() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = Arc::new(SimulatedPlc::new());
        let logger = logger_with(ds, plc);

        for _ in 0..310 {
            let metrics = logger.run_once().await;
            logger.record_metrics(metrics);
        }
        assert_eq!(logger.snapshot_metrics().len(), METRICS_WINDOW);
    }

    #[tokio::test]
    async fn record_once_writes_exactly_one_process_point() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = Arc::new(SimulatedPlc::new());
        seeded_parameter(&ds, 300);
        plc.write_parameter(300, DataType::Float, 5.0).await.unwrap();

        let logger = logger_with(ds.clone(), plc);
        let process_id = Uuid::new_v4();
        logger.record_once(process_id).await.unwrap();

        let points = ds.process_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].process_id, Some(process_id));
    }

    #[tokio::test]
    async fn bulk_read_failure_falls_back_to_individual_reads() {
        let ds = Arc::new(MemoryDatastore::new());
        let plc = Arc::new(FailingBulkPlc::new());
        let parameter = seeded_parameter(&ds, 100);
        plc.write_parameter(100, DataType::Float, 42.0).await.unwrap();

        let (machine_id, machine, state) = idle_machine();
        ds.seed_machine(machine, state);
        let cache = Arc::new(ParameterCache::default());
        let logger = ContinuousParameterLogger::new(
            ds.clone(),
            plc,
            cache,
            machine_id,
            LoggerSettings::default(),
            ByteOrder::BigEndian,
        );

        let metrics = logger.run_once().await;
        assert!(!metrics.had_error);
        assert_eq!(metrics.parameter_count, 1);

        let global = ds.global_points();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].parameter_id, parameter.parameter_id);
        assert!((global[0].value - 42.0).abs() < 0.1);
    }
}
