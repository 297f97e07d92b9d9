//! Simulated device family
//!
//! A deterministic, dependency-free driver family used by the default
//! configuration and the test suite. Each simulated device exposes a coolant
//! temperature sensor, one or more fan actuators, and optionally a hybrid
//! pump channel. Temperatures follow a triangle wave so dashboards show
//! movement without real hardware.
//!
//! Fault injection: a shared [`SimFaults`] handle flips read/write failures
//! on and off at runtime, which is how the test suite exercises degraded and
//! offline paths.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::device::{ChannelKind, DeviceId, DutyRange, SensorRange};
use crate::driver::{ChannelSpec, DeviceDriver, DiscoveredDevice, DriverFactory, ProbeOutcome};
use aquilo_error::{AquiloError, Result};

/// Shared fault-injection switchboard for a simulated device
#[derive(Debug, Default)]
pub struct SimFaults {
    inner: Mutex<FaultState>,
}

#[derive(Debug, Default)]
struct FaultState {
    fail_reads: bool,
    fail_writes: bool,
}

impl SimFaults {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    fn reads_failing(&self) -> bool {
        self.inner.lock().fail_reads
    }

    fn writes_failing(&self) -> bool {
        self.inner.lock().fail_writes
    }
}

/// Description of one simulated device
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub id: String,
    pub model: String,
    pub fan_count: u8,
    pub with_pump: bool,
    /// Base coolant temperature in °C
    pub base_temp: f64,
    /// Report this device as failing to initialize during discovery
    pub fail_init: bool,
}

impl Default for SimDeviceSpec {
    fn default() -> Self {
        Self {
            id: "sim0".to_string(),
            model: "Aquilo Simulated AIO".to_string(),
            fan_count: 2,
            with_pump: true,
            base_temp: 34.0,
            fail_init: false,
        }
    }
}

/// Driver for one simulated device
pub struct SimDriver {
    spec: SimDeviceSpec,
    faults: Arc<SimFaults>,
    /// Monotonic read counter driving the temperature wave
    reads: u64,
    /// Last duty written per actuator channel name
    duties: Vec<(String, f64)>,
}

impl SimDriver {
    pub fn new(spec: SimDeviceSpec, faults: Arc<SimFaults>) -> Self {
        Self { spec, faults, reads: 0, duties: Vec::new() }
    }

    /// Triangle wave around the base temperature, period 120 reads, ±6°C
    fn temperature(&self) -> f64 {
        let phase = (self.reads % 120) as f64;
        let wave = if phase < 60.0 { phase } else { 120.0 - phase };
        self.spec.base_temp + (wave / 60.0) * 6.0
    }

    fn duty_of(&self, channel: &str) -> f64 {
        self.duties
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, d)| *d)
            .unwrap_or(0.0)
    }
}

impl DeviceDriver for SimDriver {
    fn read(&mut self, channel: &str) -> Result<f64> {
        if self.faults.reads_failing() {
            return Err(AquiloError::device_io(&self.spec.id, "simulated read fault"));
        }
        self.reads += 1;
        match channel {
            "coolant" => Ok(self.temperature()),
            "pump" => Ok(self.duty_of("pump")),
            other => {
                // Fans report their commanded duty as a percent "tach"
                if other.starts_with("fan") {
                    Ok(self.duty_of(other))
                } else {
                    Err(AquiloError::UnknownChannel(other.to_string()))
                }
            }
        }
    }

    fn write(&mut self, channel: &str, duty: f64) -> Result<()> {
        if self.faults.writes_failing() {
            return Err(AquiloError::device_io(&self.spec.id, "simulated write fault"));
        }
        if !channel.starts_with("fan") && channel != "pump" {
            return Err(AquiloError::UnsupportedOperation {
                channel: channel.to_string(),
                operation: "write",
            });
        }
        if let Some(entry) = self.duties.iter_mut().find(|(name, _)| name == channel) {
            entry.1 = duty;
        } else {
            self.duties.push((channel.to_string(), duty));
        }
        Ok(())
    }

    fn capabilities(&self) -> Vec<ChannelSpec> {
        let mut channels = vec![ChannelSpec {
            name: "coolant".to_string(),
            label: Some("Coolant".to_string()),
            kind: ChannelKind::TemperatureSensor,
            duty_range: None,
            sensor_range: Some(SensorRange::celsius(0.0, 110.0)),
        }];

        for fan in 1..=self.spec.fan_count {
            channels.push(ChannelSpec {
                name: format!("fan{}", fan),
                label: Some(format!("Fan {}", fan)),
                kind: ChannelKind::FanOrPumpActuator,
                duty_range: Some(DutyRange::new(0.0, 100.0)),
                sensor_range: None,
            });
        }

        if self.spec.with_pump {
            channels.push(ChannelSpec {
                name: "pump".to_string(),
                label: Some("Pump".to_string()),
                kind: ChannelKind::HybridSensorActuator,
                duty_range: Some(DutyRange::new(20.0, 100.0)),
                sensor_range: Some(SensorRange {
                    unit: crate::device::SensorUnit::Percent,
                    min: 0.0,
                    max: 100.0,
                }),
            });
        }

        channels
    }
}

/// Factory for the simulated family
pub struct SimFactory {
    specs: Vec<SimDeviceSpec>,
    faults: Vec<Arc<SimFaults>>,
}

impl SimFactory {
    pub fn new(specs: Vec<SimDeviceSpec>) -> Self {
        let faults = specs.iter().map(|_| SimFaults::new()).collect();
        Self { specs, faults }
    }

    /// Fault handle for the n-th configured device (test hook)
    pub fn faults(&self, index: usize) -> Option<Arc<SimFaults>> {
        self.faults.get(index).cloned()
    }
}

impl DriverFactory for SimFactory {
    fn family(&self) -> &'static str {
        "sim"
    }

    fn probe(&self) -> Vec<ProbeOutcome> {
        self.specs
            .iter()
            .zip(self.faults.iter())
            .map(|(spec, faults)| {
                let id = DeviceId::new(&spec.id);
                if spec.fail_init {
                    ProbeOutcome::Failed {
                        id,
                        model: spec.model.clone(),
                        error: AquiloError::discovery(&spec.id, "simulated init failure"),
                    }
                } else {
                    ProbeOutcome::Ready(DiscoveredDevice {
                        id,
                        model: spec.model.clone(),
                        driver: Box::new(SimDriver::new(spec.clone(), faults.clone())),
                    })
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> SimDriver {
        SimDriver::new(SimDeviceSpec::default(), SimFaults::new())
    }

    #[test]
    fn test_capabilities_shape() {
        let d = driver();
        let caps = d.capabilities();
        // coolant + 2 fans + pump
        assert_eq!(caps.len(), 4);
        assert!(caps.iter().any(|c| c.name == "coolant"));
        assert!(caps.iter().any(|c| c.name == "pump"));
    }

    #[test]
    fn test_temperature_is_plausible() {
        let mut d = driver();
        for _ in 0..300 {
            let t = d.read("coolant").unwrap();
            assert!((28.0..=46.0).contains(&t), "temp out of band: {}", t);
        }
    }

    #[test]
    fn test_write_then_read_back() {
        let mut d = driver();
        d.write("fan1", 65.0).unwrap();
        assert_eq!(d.read("fan1").unwrap(), 65.0);
    }

    #[test]
    fn test_fault_injection() {
        let faults = SimFaults::new();
        let mut d = SimDriver::new(SimDeviceSpec::default(), faults.clone());

        faults.set_fail_reads(true);
        assert!(d.read("coolant").is_err());
        faults.set_fail_reads(false);
        assert!(d.read("coolant").is_ok());

        faults.set_fail_writes(true);
        assert!(d.write("fan1", 50.0).is_err());
    }

    #[test]
    fn test_write_to_sensor_rejected() {
        let mut d = driver();
        assert!(d.write("coolant", 50.0).is_err());
    }

    #[test]
    fn test_factory_partial_failure() {
        let factory = SimFactory::new(vec![
            SimDeviceSpec { id: "sim0".into(), ..Default::default() },
            SimDeviceSpec { id: "sim1".into(), fail_init: true, ..Default::default() },
        ]);
        let outcomes = factory.probe();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], ProbeOutcome::Ready(_)));
        assert!(matches!(outcomes[1], ProbeOutcome::Failed { .. }));
    }
}
