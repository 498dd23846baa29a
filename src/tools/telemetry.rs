//! System telemetry collaborator

use std::fmt::Write as _;

use async_trait::async_trait;
use sysinfo::{Components, System};
use tokio::sync::Mutex;

use crate::Result;

/// Temperatures above this are reported as elevated (°C)
const TEMP_WARNING_C: f32 = 70.0;

/// RAM usage above this is reported as high (percent)
const RAM_WARNING_PCT: f32 = 85.0;

/// Power draw above this is reported as high (watts)
const POWER_WARNING_W: f32 = 15.0;

/// One reading of system health
///
/// Values a platform cannot provide are `None` and omitted from the report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    /// Overall CPU usage (percent)
    pub cpu_usage: f32,
    /// Hottest CPU sensor (°C)
    pub cpu_temp: Option<f32>,
    /// GPU usage (percent)
    pub gpu_usage: Option<f32>,
    /// Hottest GPU sensor (°C)
    pub gpu_temp: Option<f32>,
    /// RAM in use (percent)
    pub ram_usage: f32,
    /// Total power draw (watts)
    pub power_watts: Option<f32>,
}

impl TelemetrySnapshot {
    /// Spoken status line with warnings appended
    #[must_use]
    pub fn report(&self) -> String {
        let mut parts = Vec::new();

        let mut cpu = format!("CPU {:.0}%", self.cpu_usage);
        if let Some(temp) = self.cpu_temp {
            let _ = write!(cpu, " at {temp:.0}°C");
        }
        parts.push(cpu);

        if self.gpu_usage.is_some() || self.gpu_temp.is_some() {
            let mut gpu = String::from("GPU");
            if let Some(usage) = self.gpu_usage {
                let _ = write!(gpu, " {usage:.0}%");
            }
            if let Some(temp) = self.gpu_temp {
                let _ = write!(gpu, " at {temp:.0}°C");
            }
            parts.push(gpu);
        }

        parts.push(format!("RAM {:.0}% used", self.ram_usage));

        if let Some(watts) = self.power_watts {
            parts.push(format!("power draw {watts:.1} watts"));
        }

        let mut status = format!("System status: {}", parts.join(", "));

        let warnings = self.warnings();
        if !warnings.is_empty() {
            let _ = write!(status, ". Warnings: {}", warnings.join(", "));
        }
        status
    }

    /// Conditions worth flagging to the operator
    #[must_use]
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.cpu_temp.is_some_and(|t| t > TEMP_WARNING_C) {
            warnings.push("CPU temperature elevated");
        }
        if self.gpu_temp.is_some_and(|t| t > TEMP_WARNING_C) {
            warnings.push("GPU temperature elevated");
        }
        if self.ram_usage > RAM_WARNING_PCT {
            warnings.push("RAM usage high");
        }
        if self.power_watts.is_some_and(|w| w > POWER_WARNING_W) {
            warnings.push("power draw high");
        }
        warnings
    }
}

/// Source of system health readings
#[async_trait]
pub trait Telemetry: Send + Sync {
    /// Take a reading
    ///
    /// # Errors
    ///
    /// Returns error if the platform cannot be queried
    async fn snapshot(&self) -> Result<TelemetrySnapshot>;
}

/// Reads CPU, memory, and sensor temperatures through `sysinfo`
pub struct SystemTelemetry {
    system: Mutex<System>,
}

impl SystemTelemetry {
    /// Create a telemetry source
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Telemetry for SystemTelemetry {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    async fn snapshot(&self) -> Result<TelemetrySnapshot> {
        let mut system = self.system.lock().await;

        // CPU usage is a delta between two refreshes
        system.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let ram_usage = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        let components = Components::new_with_refreshed_list();
        let hottest = |needles: &[&str]| {
            components
                .list()
                .iter()
                .filter(|c| {
                    let label = c.label().to_lowercase();
                    needles.iter().any(|n| label.contains(n))
                })
                .filter_map(sysinfo::Component::temperature)
                .reduce(f32::max)
        };

        let snapshot = TelemetrySnapshot {
            cpu_usage: system.global_cpu_usage(),
            cpu_temp: hottest(&["cpu", "package", "core", "tctl", "k10temp"]),
            gpu_usage: None,
            gpu_temp: hottest(&["gpu", "amdgpu", "nouveau", "nvidia"]),
            ram_usage,
            power_watts: None,
        };

        tracing::debug!(?snapshot, "telemetry read");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_full() {
        let snapshot = TelemetrySnapshot {
            cpu_usage: 42.4,
            cpu_temp: Some(55.0),
            gpu_usage: Some(10.0),
            gpu_temp: Some(48.0),
            ram_usage: 61.0,
            power_watts: Some(7.3),
        };
        assert_eq!(
            snapshot.report(),
            "System status: CPU 42% at 55°C, GPU 10% at 48°C, RAM 61% used, power draw 7.3 watts"
        );
    }

    #[test]
    fn test_report_warnings() {
        let snapshot = TelemetrySnapshot {
            cpu_usage: 90.0,
            cpu_temp: Some(75.0),
            ram_usage: 90.0,
            power_watts: Some(16.0),
            ..TelemetrySnapshot::default()
        };
        let report = snapshot.report();
        assert!(report.starts_with("System status: CPU 90% at 75°C, RAM 90% used"));
        assert!(report.ends_with(
            ". Warnings: CPU temperature elevated, RAM usage high, power draw high"
        ));
    }

    #[test]
    fn test_report_omits_missing_sensors() {
        let snapshot = TelemetrySnapshot {
            cpu_usage: 5.0,
            ram_usage: 20.0,
            ..TelemetrySnapshot::default()
        };
        assert_eq!(snapshot.report(), "System status: CPU 5%, RAM 20% used");
        assert!(snapshot.warnings().is_empty());
    }
}
