//! Terminal output formatting

use crate::driver::SweepReport;
use colored::*;
use powerbench_profiler::MeterFrame;

/// Sweep summary, one line per configuration.
pub fn format_summary(report: &SweepReport) -> String {
    let autotuned = report.cases.iter().any(|c| c.autotuned.is_some());
    let mut output = String::new();

    let mut header = format!("{:>9} {:>10} {:>9} {:>9}", "N", "TPS", "Steps", "Time");
    if autotuned {
        header.push_str(&format!(" {:>10}", "TPS_AT"));
    }
    output.push_str(&format!("{}\n", header.bold()));

    for case in &report.cases {
        output.push_str(&format!(
            "{:>9} {:>10.2e} {:>9.1e} {:>9.1e}",
            case.atoms,
            case.steps_per_sec,
            case.steps as f64,
            case.elapsed.as_secs_f64()
        ));
        if autotuned {
            match &case.autotuned {
                Some(tuned) => output.push_str(&format!(" {:>10.2e}", tuned.steps_per_sec)),
                None => output.push_str(&format!(" {:>10}", "-")),
            }
        }
        output.push('\n');
    }
    output
}

/// One meter reading, all ten values with units.
pub fn format_frame(index: u64, frame: &MeterFrame) -> String {
    let s = &frame.sample;
    format!(
        "{} {:>8.2} V {:>7.3} A {:>8.2} W {:>8.2} var {:>8.2} VA {:>10.1} Ws {:>8.0} s {:>6.2} Hz {:>7.2} deg PF {:.3}",
        format!("[{index}]").cyan(),
        s.voltage,
        s.current,
        s.real_power,
        s.reactive_power,
        s.apparent_power,
        s.energy,
        s.elapsed,
        s.frequency,
        s.phase_angle,
        s.power_factor,
    )
}

pub fn format_error(msg: &str) -> String {
    format!("{} {}", "Error:".red().bold(), msg)
}

pub fn format_success(msg: &str) -> String {
    format!("{} {}", "✓".green().bold(), msg)
}

pub fn format_warning(msg: &str) -> String {
    format!("{} {}", "Warning:".yellow().bold(), msg)
}
