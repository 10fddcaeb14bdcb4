//! Device reader: executes a device's read plan over an open Modbus session
//! and turns raw register words into scaled, typed readings.
//!
//! The plan is compiled once per device from its schema
//! ([`DevicePlan::build`]): register indices are resolved, the address base
//! is applied to the wire addresses, scaling equations are compiled. Errors
//! at this stage are configuration errors and quarantine the device. A live
//! read isolates failures instead: a failed range never aborts the cycle, a
//! failed parameter never fails its range.

use async_trait::async_trait;
use chrono::Utc;

use daqsrv_protocol::{
    ByteOrder, DataType, Device, DeviceError, DeviceReadingSet, Error, Reading, RegisterFunction,
    Result, Value,
};

use crate::codec;
use crate::eval::Expr;
use crate::modbus::Transport;

/// The transport surface the reader needs, kept narrow so reads can be
/// exercised against a scripted fake.
#[async_trait]
pub trait ModbusClient: Send {
    async fn read_coils(&mut self, addr: u16, cnt: u16) -> Result<Vec<bool>>;
    async fn read_discrete_inputs(&mut self, addr: u16, cnt: u16) -> Result<Vec<bool>>;
    async fn read_holding_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>>;
    async fn read_input_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>>;
}

#[async_trait]
impl ModbusClient for Transport {
    async fn read_coils(&mut self, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        Transport::read_coils(self, addr, cnt).await
    }

    async fn read_discrete_inputs(&mut self, addr: u16, cnt: u16) -> Result<Vec<bool>> {
        Transport::read_discrete_inputs(self, addr, cnt).await
    }

    async fn read_holding_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        Transport::read_holding_registers(self, addr, cnt).await
    }

    async fn read_input_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>> {
        Transport::read_input_registers(self, addr, cnt).await
    }
}

#[derive(Clone, Debug)]
struct Scaling {
    factor: f64,
    equation: Option<Expr>,
    decimal_point: Option<u32>,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Clone, Debug)]
struct PlannedParam {
    name: String,
    /// Absolute address in the configured (logical) address space.
    address: u16,
    offset: usize,
    data_type: DataType,
    byte_order: ByteOrder,
    scaling: Scaling,
    unit: Option<String>,
}

#[derive(Clone, Debug)]
struct PlannedRange {
    function: RegisterFunction,
    start: u16,
    /// Start address actually sent on the wire (`start - address_base`).
    wire_start: u16,
    count: u16,
    params: Vec<PlannedParam>,
}

/// A validated, compiled read plan for one device.
#[derive(Clone, Debug)]
pub struct DevicePlan {
    pub device_id: String,
    pub device_name: String,
    pub unit_id: u8,
    ranges: Vec<PlannedRange>,
}

impl DevicePlan {
    /// Compile a device schema into a read plan. The schema is normalized
    /// and validated first; every failure here is fatal for the device.
    pub fn build(device: &Device) -> Result<DevicePlan> {
        if !device.enabled {
            return Err(Error::Device(DeviceError::Disabled));
        }
        if device.data_points.is_empty() {
            return Err(Error::Device(DeviceError::NoConfiguration));
        }
        let mut device = device.clone();
        device.prepare()?;

        let mut ranges = Vec::with_capacity(device.data_points.len());
        for point in &device.data_points {
            let range = &point.range;
            let wire_start = range.start_address - device.address_base as u16;
            let mut params = Vec::with_capacity(point.parameters.len());
            for param in &point.parameters {
                let words = param.data_type.word_count();
                if !range.contains(param.register_index, words) {
                    // C4 contract: out-of-range parameters are skipped, not
                    // failed
                    log::warn!(
                        "device {}: parameter {} at {} falls outside range [{}, {}), skipping",
                        device.id,
                        param.name,
                        param.register_index,
                        range.start_address,
                        range.start_address as u32 + range.count as u32
                    );
                    continue;
                }
                let equation = match &param.scaling_equation {
                    Some(src) => Some(Expr::parse(src).map_err(Error::config)?),
                    None => None,
                };
                params.push(PlannedParam {
                    name: param.name.clone(),
                    address: param.register_index,
                    offset: (param.register_index - range.start_address) as usize,
                    data_type: param.data_type,
                    byte_order: param.byte_order(),
                    scaling: Scaling {
                        factor: param.scaling_factor(),
                        equation,
                        decimal_point: param.decimal_point,
                        min: param.min_value,
                        max: param.max_value,
                    },
                    unit: param.unit.clone(),
                });
            }
            ranges.push(PlannedRange {
                function: range.function_code,
                start: range.start_address,
                wire_start,
                count: range.count,
                params,
            });
        }
        Ok(DevicePlan {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            unit_id: device.unit_id(),
            ranges,
        })
    }

    /// A derived one-item plan for cheap liveness probes: the first
    /// parameter of the first range, or a bare single-item read when the
    /// range carries no parameters. Used by heartbeats and connection
    /// tests.
    pub fn heartbeat_plan(&self) -> Option<DevicePlan> {
        let range = self.ranges.first()?;
        let probe_range = match range.params.first() {
            Some(param) => {
                let words = param.data_type.word_count() as u16;
                let mut probe_param = param.clone();
                probe_param.offset = 0;
                PlannedRange {
                    function: range.function,
                    start: param.address,
                    wire_start: range.wire_start + param.offset as u16,
                    count: if range.function.is_bits() { 1 } else { words },
                    params: vec![probe_param],
                }
            }
            None => PlannedRange {
                function: range.function,
                start: range.start,
                wire_start: range.wire_start,
                count: 1,
                params: Vec::new(),
            },
        };
        Some(DevicePlan {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            unit_id: self.unit_id,
            ranges: vec![probe_range],
        })
    }

    /// All planned parameter addresses, in plan order.
    pub fn param_addresses(&self) -> Vec<u16> {
        self.ranges
            .iter()
            .flat_map(|range| range.params.iter().map(|param| param.address))
            .collect()
    }
}

/// Read every configured range of the plan once. Range failures are
/// reported per-parameter and do not abort the cycle; only a cycle in which
/// not a single range succeeded is an error.
pub async fn read_device<C: ModbusClient>(
    plan: &DevicePlan,
    client: &mut C,
) -> Result<DeviceReadingSet> {
    let mut readings = Vec::new();
    let mut succeeded = 0_usize;
    let mut failed_ranges = 0_usize;
    let mut fatal_error: Option<Error> = None;

    for range in &plan.ranges {
        let outcome = read_range(range, client).await;
        match outcome {
            Ok(mut range_readings) => {
                succeeded += 1;
                readings.append(&mut range_readings);
            }
            Err(err) => {
                log::warn!(
                    "device {}: range {}+{} failed: {}",
                    plan.device_id,
                    range.start,
                    range.count,
                    err
                );
                failed_ranges += 1;
                for param in &range.params {
                    readings.push(Reading::Failed {
                        name: param.name.clone(),
                        address: param.address,
                        error: err.to_string(),
                    });
                }
                // a Modbus exception proves the device answered; only
                // transport-level trouble can fail the whole cycle
                if fatal_error.is_none() && err.poisons_session() {
                    fatal_error = Some(err);
                }
            }
        }
    }

    if succeeded == 0 {
        if let Some(err) = fatal_error {
            return Err(err);
        }
    }

    let failed_params = readings
        .iter()
        .any(|x| matches!(x, Reading::Failed { .. }));
    Ok(DeviceReadingSet {
        device_id: plan.device_id.clone(),
        device_name: plan.device_name.clone(),
        timestamp: Utc::now(),
        readings,
        partial: failed_ranges > 0 || failed_params,
    })
}

async fn read_range<C: ModbusClient>(
    range: &PlannedRange,
    client: &mut C,
) -> Result<Vec<Reading>> {
    let mut readings = Vec::with_capacity(range.params.len());
    if range.function.is_bits() {
        let bits = match range.function {
            RegisterFunction::Coils => client.read_coils(range.wire_start, range.count).await?,
            _ => {
                client
                    .read_discrete_inputs(range.wire_start, range.count)
                    .await?
            }
        };
        for param in &range.params {
            match bits.get(param.offset) {
                Some(bit) => readings.push(Reading::Ok {
                    name: param.name.clone(),
                    address: param.address,
                    value: Value::Bool(*bit),
                    unit: param.unit.clone(),
                    data_type: param.data_type,
                }),
                None => readings.push(Reading::Failed {
                    name: param.name.clone(),
                    address: param.address,
                    error: "response shorter than requested".to_string(),
                }),
            }
        }
    } else {
        let words = match range.function {
            RegisterFunction::HoldingRegisters => {
                client
                    .read_holding_registers(range.wire_start, range.count)
                    .await?
            }
            _ => {
                client
                    .read_input_registers(range.wire_start, range.count)
                    .await?
            }
        };
        for param in &range.params {
            readings.push(decode_param(param, &words));
        }
    }
    Ok(readings)
}

fn decode_param(param: &PlannedParam, words: &[u16]) -> Reading {
    let end = param.offset + param.data_type.word_count();
    let slice = match words.get(param.offset..end) {
        Some(slice) => slice,
        None => {
            return Reading::Failed {
                name: param.name.clone(),
                address: param.address,
                error: "response shorter than requested".to_string(),
            }
        }
    };
    let decoded = match codec::decode(param.data_type, param.byte_order, slice) {
        Ok(value) => value,
        Err(err) => {
            return Reading::Failed {
                name: param.name.clone(),
                address: param.address,
                error: err.to_string(),
            }
        }
    };
    let value = match decoded {
        Value::Null => {
            return Reading::Failed {
                name: param.name.clone(),
                address: param.address,
                error: "value is not finite".to_string(),
            }
        }
        Value::Number(x) => {
            let scaled = apply_scaling(x, &param.scaling);
            if !scaled.is_finite() {
                return Reading::Failed {
                    name: param.name.clone(),
                    address: param.address,
                    error: "scaling produced a non-finite value".to_string(),
                };
            }
            Value::Number(scaled)
        }
        // booleans pass through scaling untouched
        other => other,
    };
    Reading::Ok {
        name: param.name.clone(),
        address: param.address,
        value,
        unit: param.unit.clone(),
        data_type: param.data_type,
    }
}

fn apply_scaling(raw: f64, scaling: &Scaling) -> f64 {
    let mut value = raw * scaling.factor;
    if let Some(equation) = &scaling.equation {
        value = equation.eval(value);
    }
    if let Some(digits) = scaling.decimal_point {
        value = round_to(value, digits);
    }
    if let Some(min) = scaling.min {
        value = value.max(min);
    }
    if let Some(max) = scaling.max {
        value = value.min(max);
    }
    value
}

/// Banker's rounding at `digits` decimal places. Values smaller in
/// magnitude than the rounding quantum pass through unrounded so they are
/// not silently zeroed.
fn round_to(value: f64, digits: u32) -> f64 {
    let scale = 10_f64.powi(digits as i32);
    if value != 0.0 && value.abs() < 1.0 / scale {
        return value;
    }
    round_ties_even(value * scale) / scale
}

fn round_ties_even(value: f64) -> f64 {
    let rounded = value.round();
    if (value - value.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
        rounded - (rounded - value).signum()
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daqsrv_protocol::{
        AdvancedSettings, ConnectionSettings, DataPoint, ModbusException, Parameter,
        ProtocolError, RegisterRange,
    };
    use std::collections::HashMap;

    struct FakeClient {
        words: HashMap<u16, Result<Vec<u16>>>,
        bits: HashMap<u16, Result<Vec<bool>>>,
    }

    impl FakeClient {
        fn new() -> Self {
            Self {
                words: HashMap::new(),
                bits: HashMap::new(),
            }
        }

        fn words(mut self, addr: u16, values: Vec<u16>) -> Self {
            self.words.insert(addr, Ok(values));
            self
        }

        fn words_err(mut self, addr: u16, err: Error) -> Self {
            self.words.insert(addr, Err(err));
            self
        }

        fn bits(mut self, addr: u16, values: Vec<bool>) -> Self {
            self.bits.insert(addr, Ok(values));
            self
        }
    }

    #[async_trait]
    impl ModbusClient for FakeClient {
        async fn read_coils(&mut self, addr: u16, _cnt: u16) -> Result<Vec<bool>> {
            self.bits.get(&addr).cloned().unwrap_or_else(|| {
                Err(Error::protocol(ModbusException::IllegalAddress))
            })
        }

        async fn read_discrete_inputs(&mut self, addr: u16, cnt: u16) -> Result<Vec<bool>> {
            self.read_coils(addr, cnt).await
        }

        async fn read_holding_registers(&mut self, addr: u16, _cnt: u16) -> Result<Vec<u16>> {
            self.words.get(&addr).cloned().unwrap_or_else(|| {
                Err(Error::protocol(ModbusException::IllegalAddress))
            })
        }

        async fn read_input_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>> {
            self.read_holding_registers(addr, cnt).await
        }
    }

    fn parameter(name: &str, address: u16, data_type: DataType) -> Parameter {
        Parameter {
            name: name.to_string(),
            data_type,
            byte_order: None,
            register_index: address,
            word_count: None,
            scaling_factor: None,
            scale_factor: None,
            scaling_equation: None,
            decimal_point: None,
            unit: None,
            min_value: None,
            max_value: None,
        }
    }

    fn device(data_points: Vec<DataPoint>) -> Device {
        Device {
            id: "dev-1".to_string(),
            name: "Meter A".to_string(),
            enabled: true,
            connection: ConnectionSettings::Tcp {
                ip: "192.168.0.10".to_string(),
                port: 502,
                unit_id: 1,
            },
            data_points,
            driver_id: None,
            address_base: 0,
            advanced_settings: AdvancedSettings::default(),
            last_seen: None,
        }
    }

    fn holding_range(start: u16, count: u16, parameters: Vec<Parameter>) -> DataPoint {
        DataPoint {
            range: RegisterRange {
                function_code: RegisterFunction::HoldingRegisters,
                start_address: start,
                count,
            },
            parameters,
        }
    }

    #[tokio::test]
    async fn scales_and_rounds_a_register() {
        let mut param = parameter("flow", 102, DataType::Uint16);
        param.scaling_factor = Some(0.1);
        param.decimal_point = Some(2);
        let device = device(vec![holding_range(100, 5, vec![param])]);
        let plan = DevicePlan::build(&device).unwrap();

        let mut client = FakeClient::new().words(100, vec![10, 20, 30, 40, 50]);
        let set = read_device(&plan, &mut client).await.unwrap();
        assert!(!set.partial);
        assert_eq!(set.readings.len(), 1);
        match &set.readings[0] {
            Reading::Ok { address, value, .. } => {
                assert_eq!(*address, 102);
                assert_eq!(*value, Value::Number(3.0));
            }
            other => panic!("unexpected reading: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_range_is_isolated_and_marks_partial() {
        let device = device(vec![
            holding_range(100, 2, vec![parameter("a", 100, DataType::Uint16)]),
            holding_range(200, 2, vec![parameter("b", 200, DataType::Uint16)]),
        ]);
        let plan = DevicePlan::build(&device).unwrap();

        let mut client = FakeClient::new()
            .words_err(100, Error::protocol(ModbusException::IllegalAddress))
            .words(200, vec![7, 8]);
        let set = read_device(&plan, &mut client).await.unwrap();
        assert!(set.partial);
        match &set.readings[0] {
            Reading::Failed { error, .. } => assert!(error.contains("Illegal Data Address")),
            other => panic!("unexpected reading: {:?}", other),
        }
        match &set.readings[1] {
            Reading::Ok { value, .. } => assert_eq!(*value, Value::Number(7.0)),
            other => panic!("unexpected reading: {:?}", other),
        }
    }

    #[tokio::test]
    async fn all_ranges_failing_is_a_cycle_error() {
        let device = device(vec![holding_range(
            100,
            2,
            vec![parameter("a", 100, DataType::Uint16)],
        )]);
        let plan = DevicePlan::build(&device).unwrap();
        let mut client =
            FakeClient::new().words_err(100, Error::Protocol(ProtocolError::Timeout));
        assert!(read_device(&plan, &mut client).await.is_err());
    }

    #[tokio::test]
    async fn exception_on_every_range_still_yields_a_reading_set() {
        // the device answered, just not with data; the cycle is not a
        // connection failure
        let device = device(vec![holding_range(
            100,
            2,
            vec![parameter("a", 100, DataType::Uint16)],
        )]);
        let plan = DevicePlan::build(&device).unwrap();
        let mut client =
            FakeClient::new().words_err(100, Error::protocol(ModbusException::SlaveBusy));
        let set = read_device(&plan, &mut client).await.unwrap();
        assert!(set.partial);
        assert!(matches!(set.readings[0], Reading::Failed { .. }));
    }

    #[tokio::test]
    async fn out_of_range_parameters_are_skipped() {
        let inside = parameter("inside", 101, DataType::Uint16);
        // a two-word value whose tail sticks out of the range
        let sticking_out = parameter("outside", 104, DataType::Uint32);
        let device = device(vec![holding_range(100, 5, vec![inside, sticking_out])]);
        let plan = DevicePlan::build(&device).unwrap();

        let mut client = FakeClient::new().words(100, vec![1, 2, 3, 4, 5]);
        let set = read_device(&plan, &mut client).await.unwrap();
        assert_eq!(set.readings.len(), 1);
        assert_eq!(set.readings[0].address(), 101);
    }

    #[tokio::test]
    async fn bool_ranges_read_bits() {
        let device = device(vec![DataPoint {
            range: RegisterRange {
                function_code: RegisterFunction::Coils,
                start_address: 10,
                count: 4,
            },
            parameters: vec![parameter("pump", 12, DataType::Bool)],
        }]);
        let plan = DevicePlan::build(&device).unwrap();

        let mut client = FakeClient::new().bits(10, vec![false, false, true, false]);
        let set = read_device(&plan, &mut client).await.unwrap();
        match &set.readings[0] {
            Reading::Ok { value, .. } => assert_eq!(*value, Value::Bool(true)),
            other => panic!("unexpected reading: {:?}", other),
        }
    }

    #[tokio::test]
    async fn address_base_shifts_only_the_wire_address() {
        let mut device = device(vec![holding_range(
            100,
            2,
            vec![parameter("a", 100, DataType::Uint16)],
        )]);
        device.address_base = 1;
        let plan = DevicePlan::build(&device).unwrap();

        // the fake is keyed by the wire address
        let mut client = FakeClient::new().words(99, vec![42, 0]);
        let set = read_device(&plan, &mut client).await.unwrap();
        assert_eq!(set.readings[0].address(), 100);
        assert_eq!(set.readings[0].value(), Value::Number(42.0));
    }

    #[tokio::test]
    async fn equation_and_clamp_apply_after_factor() {
        let mut param = parameter("temp", 100, DataType::Int16);
        param.scaling_factor = Some(0.1);
        param.scaling_equation = Some("x * 1.8 + 32".to_string());
        param.max_value = Some(100.0);
        let device = device(vec![holding_range(100, 1, vec![param])]);
        let plan = DevicePlan::build(&device).unwrap();

        // raw 500 -> 50.0 degC -> 122 degF -> clamped to 100
        let mut client = FakeClient::new().words(100, vec![500]);
        let set = read_device(&plan, &mut client).await.unwrap();
        assert_eq!(set.readings[0].value(), Value::Number(100.0));
    }

    #[test]
    fn plan_rejects_disabled_and_empty_devices() {
        let mut dev = device(vec![]);
        assert!(matches!(
            DevicePlan::build(&dev).unwrap_err(),
            Error::Device(DeviceError::NoConfiguration)
        ));
        dev.enabled = false;
        assert!(matches!(
            DevicePlan::build(&dev).unwrap_err(),
            Error::Device(DeviceError::Disabled)
        ));
    }

    #[test]
    fn plan_rejects_bad_equations() {
        let mut param = parameter("a", 100, DataType::Uint16);
        param.scaling_equation = Some("x + y".to_string());
        let dev = device(vec![holding_range(100, 1, vec![param])]);
        let err = DevicePlan::build(&dev).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn bankers_rounding_and_small_value_passthrough() {
        // 2.125 and its scaled form are exactly representable, so the tie
        // is real and resolves to the even neighbour
        assert_eq!(round_to(2.125, 2), 2.12);
        assert_eq!(round_to(3.14159, 2), 3.14);
        // |v| below the quantum is preserved, not zeroed
        assert_eq!(round_to(0.0004, 2), 0.0004);
        assert_eq!(round_to(0.0, 2), 0.0);
        assert_eq!(round_ties_even(2.5), 2.0);
        assert_eq!(round_ties_even(3.5), 4.0);
        assert_eq!(round_ties_even(-2.5), -2.0);
    }
}
