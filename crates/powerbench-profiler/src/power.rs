use crate::eng110::{Eng110Meter, MeterConfig};
use crate::error::{Result, TelemetryError};
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Trait for reading instantaneous power from a hardware source.
///
/// Implementations block (subprocess, serial I/O); samplers call them on
/// the blocking pool. Use [`MockPowerSource`] for deterministic tests.
pub trait PowerSource: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    fn read_watts(&self) -> Result<f64>;
}

/// A mock power source that returns a fixed wattage.
pub struct MockPowerSource {
    pub watts: f64,
}

impl PowerSource for MockPowerSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn read_watts(&self) -> Result<f64> {
        Ok(self.watts)
    }
}

/// Wall-socket power from the ENG110 meter (real power field).
pub struct Eng110Source {
    meter: Eng110Meter,
}

impl Eng110Source {
    pub fn new(config: MeterConfig) -> Self {
        Self {
            meter: Eng110Meter::new(config),
        }
    }
}

impl PowerSource for Eng110Source {
    fn name(&self) -> &str {
        "eng110"
    }

    fn read_watts(&self) -> Result<f64> {
        let frame = self.meter.query()?;
        Ok(round_centiwatts(f64::from(frame.sample.real_power)))
    }
}

/// GPU board power via `nvidia-smi`.
pub struct NvidiaSmiSource {
    program: String,
    gpu_index: u32,
    timeout: Duration,
}

impl NvidiaSmiSource {
    pub fn new(program: impl Into<String>, gpu_index: u32) -> Self {
        Self {
            program: program.into(),
            gpu_index,
            timeout: QUERY_TIMEOUT,
        }
    }

    /// Kill the utility if it has not exited after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.gpu_index.to_string(),
            "--query-gpu=power.draw".to_string(),
            "--format=csv,nounits,noheader".to_string(),
        ]
    }
}

impl Default for NvidiaSmiSource {
    fn default() -> Self {
        Self::new("nvidia-smi", 0)
    }
}

impl PowerSource for NvidiaSmiSource {
    fn name(&self) -> &str {
        "nvidia-smi"
    }

    fn read_watts(&self) -> Result<f64> {
        let mut command = Command::new(&self.program);
        command.args(self.args());
        let output = run_with_deadline(&mut command, self.timeout, self.name())?;
        if !output.status.success() {
            return Err(TelemetryError::parse(
                self.name(),
                format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        parse_power_draw(self.name(), &String::from_utf8_lossy(&output.stdout))
    }
}

/// Run `command` to completion, killing it once `timeout` has passed.
///
/// A hung utility would otherwise hold its sampler past shutdown.
pub fn run_with_deadline(command: &mut Command, timeout: Duration, source: &str) -> Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_end(&mut stdout)?;
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr)?;
            }
            return Ok(Output { status, stdout, stderr });
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TelemetryError::Timeout {
                source_name: source.to_string(),
                timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Parse the single `power.draw` value printed by the vendor utility.
///
/// Exactly one non-empty line holding a finite number is accepted.
pub fn parse_power_draw(source: &str, stdout: &str) -> Result<f64> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let line = lines
        .next()
        .ok_or_else(|| TelemetryError::parse(source, "empty output"))?;
    if lines.next().is_some() {
        return Err(TelemetryError::parse(source, "expected a single line"));
    }

    let watts: f64 = line
        .parse()
        .map_err(|_| TelemetryError::parse(source, format!("not a number: {line:?}")))?;
    if !watts.is_finite() {
        return Err(TelemetryError::parse(source, format!("not finite: {line:?}")));
    }
    Ok(watts)
}

fn round_centiwatts(watts: f64) -> f64 {
    (watts * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_power_source() {
        let src = MockPowerSource { watts: 75.0 };
        assert_eq!(src.read_watts().unwrap(), 75.0);
    }

    #[test]
    fn parse_plain_value() {
        assert_eq!(parse_power_draw("gpu", "87.43\n").unwrap(), 87.43);
        assert_eq!(parse_power_draw("gpu", "  250.00 \r\n").unwrap(), 250.0);
    }

    #[test]
    fn parse_rejects_non_numeric() {
        for bad in ["", "\n", "[N/A]\n", "87.4 W\n", "NaN\n", "inf\n"] {
            assert!(
                matches!(parse_power_draw("gpu", bad), Err(TelemetryError::Parse { .. })),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn parse_rejects_multi_line() {
        // two GPUs selected by mistake
        assert!(matches!(
            parse_power_draw("gpu", "87.43\n90.12\n"),
            Err(TelemetryError::Parse { .. })
        ));
    }

    #[test]
    fn missing_utility_is_io_error() {
        let src = NvidiaSmiSource::new("/nonexistent/nvidia-smi", 0);
        assert!(matches!(src.read_watts(), Err(TelemetryError::Io(_))));
    }

    #[cfg(unix)]
    #[test]
    fn hung_utility_is_killed_after_deadline() {
        let start = Instant::now();
        let mut command = Command::new("sleep");
        command.arg("30");
        let err = run_with_deadline(&mut command, Duration::from_millis(200), "gpu").unwrap_err();
        assert!(matches!(err, TelemetryError::Timeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn quick_utility_output_is_collected() {
        let mut command = Command::new("echo");
        command.arg("87.43");
        let output = run_with_deadline(&mut command, Duration::from_secs(10), "gpu").unwrap();
        assert!(output.status.success());
        assert_eq!(parse_power_draw("gpu", &String::from_utf8_lossy(&output.stdout)).unwrap(), 87.43);
    }

    #[test]
    fn query_arguments_select_gpu() {
        let src = NvidiaSmiSource::new("nvidia-smi", 2);
        assert_eq!(
            src.args(),
            vec!["-i", "2", "--query-gpu=power.draw", "--format=csv,nounits,noheader"]
        );
    }

    #[test]
    fn rounds_meter_readings() {
        assert_eq!(round_centiwatts(f64::from(230.1f32)), 230.1);
        assert_eq!(round_centiwatts(285.456), 285.46);
    }
}
