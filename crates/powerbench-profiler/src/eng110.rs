//! ENG110 serial power meter protocol
//!
//! The meter answers a fixed 5-byte request with a 63-byte frame:
//!
//! ```text
//! offset  len  content
//! 0       3    header
//! 3       6    device timestamp (unused by callers)
//! 9       40   ten little-endian f32 readings
//! 49      14   trailer
//! ```
//!
//! A port is opened per query and released when the query returns, whether
//! it succeeded or not.

use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Request frame asking the meter for one reading.
pub const COMMAND_FRAME: [u8; 5] = [0x02, 0x05, 0x95, 0x61, 0x03];

/// Exact length of a meter reply.
pub const RESPONSE_LEN: usize = 63;

/// Number of f32 readings carried by a reply.
pub const VALUE_COUNT: usize = 10;

const TIMESTAMP_OFFSET: usize = 3;
const TIMESTAMP_LEN: usize = 6;
const VALUES_OFFSET: usize = 9;
const VALUES_END: usize = VALUES_OFFSET + VALUE_COUNT * 4;

/// One decoded meter reading, in the order the device reports them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerSample {
    /// True RMS voltage [V]
    pub voltage: f32,
    /// True RMS current [A]
    pub current: f32,
    /// Real power [W]
    pub real_power: f32,
    /// Reactive power [VAr]
    pub reactive_power: f32,
    /// Apparent power [VA]
    pub apparent_power: f32,
    /// Energy logged since the meter started [Ws]
    pub energy: f32,
    /// Time since logging started [s]
    pub elapsed: f32,
    /// Line frequency [Hz]
    pub frequency: f32,
    /// Measured phase angle
    pub phase_angle: f32,
    /// cos(phi), computed as W/VA
    pub power_factor: f32,
}

impl PowerSample {
    /// Build a sample from the ten readings in wire order.
    pub fn from_values(v: [f32; VALUE_COUNT]) -> Self {
        Self {
            voltage: v[0],
            current: v[1],
            real_power: v[2],
            reactive_power: v[3],
            apparent_power: v[4],
            energy: v[5],
            elapsed: v[6],
            frequency: v[7],
            phase_angle: v[8],
            power_factor: v[9],
        }
    }

    /// The ten readings in wire order.
    pub fn values(&self) -> [f32; VALUE_COUNT] {
        [
            self.voltage,
            self.current,
            self.real_power,
            self.reactive_power,
            self.apparent_power,
            self.energy,
            self.elapsed,
            self.frequency,
            self.phase_angle,
            self.power_factor,
        ]
    }

    /// Encode the readings as the 40 bytes found at offset 9 of a reply.
    pub fn to_le_bytes(&self) -> [u8; VALUE_COUNT * 4] {
        let mut out = [0u8; VALUE_COUNT * 4];
        for (chunk, value) in out.chunks_exact_mut(4).zip(self.values()) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// A decoded reply: raw device timestamp plus the readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterFrame {
    pub timestamp: [u8; TIMESTAMP_LEN],
    pub sample: PowerSample,
}

impl MeterFrame {
    /// Serialize into a full reply frame. Header and trailer bytes are zero.
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut frame = [0u8; RESPONSE_LEN];
        frame[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_LEN].copy_from_slice(&self.timestamp);
        frame[VALUES_OFFSET..VALUES_END].copy_from_slice(&self.sample.to_le_bytes());
        frame
    }
}

/// Decode a reply frame. Anything other than exactly [`RESPONSE_LEN`] bytes
/// is rejected without producing a partial sample.
pub fn decode_response(bytes: &[u8]) -> Result<MeterFrame> {
    if bytes.len() != RESPONSE_LEN {
        return Err(TelemetryError::Protocol {
            expected: RESPONSE_LEN,
            received: bytes.len(),
        });
    }

    let mut timestamp = [0u8; TIMESTAMP_LEN];
    timestamp.copy_from_slice(&bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_LEN]);

    let mut values = [0f32; VALUE_COUNT];
    for (value, chunk) in values
        .iter_mut()
        .zip(bytes[VALUES_OFFSET..VALUES_END].chunks_exact(4))
    {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    Ok(MeterFrame {
        timestamp,
        sample: PowerSample::from_values(values),
    })
}

/// Byte link to a meter.
///
/// Implemented for real serial ports; tests provide in-memory links.
pub trait MeterLink: Read + Write {
    /// Drop anything already buffered on the input side.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Bytes available to read without blocking.
    fn pending(&mut self) -> io::Result<usize>;
}

impl MeterLink for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn pending(&mut self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

/// Run one request/response exchange on an open link.
///
/// A timeout before any reply byte arrives is a device error; a reply that
/// stops short or runs long is a protocol error.
pub fn query_power_meter<L: MeterLink + ?Sized>(link: &mut L, port: &str) -> Result<MeterFrame> {
    // stale replies from an earlier timed-out request
    link.discard_input()
        .map_err(|e| TelemetryError::device_io(port, format!("clear input: {e}")))?;

    link.write_all(&COMMAND_FRAME)
        .and_then(|_| link.flush())
        .map_err(|e| TelemetryError::device_io(port, format!("write command: {e}")))?;

    let mut buf = [0u8; RESPONSE_LEN];
    let mut received = 0;
    while received < RESPONSE_LEN {
        match link.read(&mut buf[received..]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(TelemetryError::device_io(port, format!("read reply: {e}"))),
        }
    }

    if received == 0 {
        return Err(TelemetryError::device_io(port, "timed out waiting for reply"));
    }
    if received < RESPONSE_LEN {
        return Err(TelemetryError::Protocol {
            expected: RESPONSE_LEN,
            received,
        });
    }

    let excess = link.pending().unwrap_or(0);
    if excess > 0 {
        return Err(TelemetryError::Protocol {
            expected: RESPONSE_LEN,
            received: RESPONSE_LEN + excess,
        });
    }

    decode_response(&buf)
}

/// Serial link settings for the meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub port: String,
    /// Line speed (the ENG110 only speaks 9600)
    pub baud_rate: u32,
    /// Read timeout
    pub timeout: Duration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout: Duration::from_secs(2),
        }
    }
}

/// ENG110 meter on a serial port.
#[derive(Debug, Clone)]
pub struct Eng110Meter {
    config: MeterConfig,
}

impl Eng110Meter {
    pub fn new(config: MeterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Open the port, run one exchange, and close the port again.
    pub fn query(&self) -> Result<MeterFrame> {
        let mut port = serialport::new(&self.config.port, self.config.baud_rate)
            .timeout(self.config.timeout)
            .open()
            .map_err(|e| TelemetryError::device_io(&self.config.port, format!("open: {e}")))?;

        query_power_meter(&mut port, &self.config.port)
        // port dropped here, on both paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// In-memory meter that answers every command with a canned reply.
    pub(crate) struct ScriptedLink {
        pub stale: Vec<u8>,
        pub reply: Vec<u8>,
        pub chunk: usize,
        pub written: Vec<u8>,
        pub discarded: usize,
        cursor: usize,
        answered: bool,
    }

    impl ScriptedLink {
        pub(crate) fn new(reply: Vec<u8>) -> Self {
            Self {
                stale: Vec::new(),
                reply,
                chunk: 16,
                written: Vec::new(),
                discarded: 0,
                cursor: 0,
                answered: false,
            }
        }

        fn buffered(&self) -> &[u8] {
            if self.answered {
                &self.reply[self.cursor..]
            } else {
                &self.stale[self.cursor..]
            }
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let available = self.buffered();
            if available.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
            }
            let n = available.len().min(buf.len()).min(self.chunk);
            buf[..n].copy_from_slice(&available[..n]);
            self.cursor += n;
            Ok(n)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if self.written.ends_with(&COMMAND_FRAME) {
                self.answered = true;
                self.cursor = 0;
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl MeterLink for ScriptedLink {
        fn discard_input(&mut self) -> io::Result<()> {
            self.discarded += self.buffered().len();
            self.cursor = if self.answered { self.reply.len() } else { self.stale.len() };
            Ok(())
        }

        fn pending(&mut self) -> io::Result<usize> {
            Ok(self.buffered().len())
        }
    }

    pub(crate) fn sample_frame(real_power: f32) -> [u8; RESPONSE_LEN] {
        MeterFrame {
            timestamp: [24, 5, 17, 12, 30, 59],
            sample: PowerSample::from_values([
                230.1, 1.25, real_power, 12.0, 287.6, 9000.0, 42.0, 50.0, 0.3, 0.99,
            ]),
        }
        .encode()
    }

    #[test]
    fn decode_reads_fields_in_wire_order() {
        let frame = decode_response(&sample_frame(285.5)).unwrap();
        assert_eq!(frame.timestamp, [24, 5, 17, 12, 30, 59]);
        assert_eq!(frame.sample.voltage, 230.1);
        assert_eq!(frame.sample.real_power, 285.5);
        assert_eq!(frame.sample.power_factor, 0.99);
    }

    #[test]
    fn decode_rejects_short_and_long_frames() {
        let frame = sample_frame(10.0);
        for len in [0, 5, 62] {
            match decode_response(&frame[..len]) {
                Err(TelemetryError::Protocol { expected, received }) => {
                    assert_eq!(expected, RESPONSE_LEN);
                    assert_eq!(received, len);
                }
                other => panic!("expected protocol error, got {other:?}"),
            }
        }

        let mut long = frame.to_vec();
        long.push(0);
        assert!(matches!(
            decode_response(&long),
            Err(TelemetryError::Protocol { received: 64, .. })
        ));
    }

    #[test]
    fn query_discards_stale_bytes_and_sends_command() {
        let mut link = ScriptedLink::new(sample_frame(120.0).to_vec());
        link.stale = vec![0xAA; 7];

        let frame = query_power_meter(&mut link, "mock").unwrap();

        assert_eq!(link.discarded, 7);
        assert_eq!(link.written, COMMAND_FRAME);
        assert_eq!(frame.sample.real_power, 120.0);
    }

    #[test]
    fn query_short_reply_is_protocol_error() {
        let mut link = ScriptedLink::new(sample_frame(1.0)[..62].to_vec());
        assert!(matches!(
            query_power_meter(&mut link, "mock"),
            Err(TelemetryError::Protocol { received: 62, .. })
        ));
    }

    #[test]
    fn query_long_reply_is_protocol_error() {
        let mut reply = sample_frame(1.0).to_vec();
        reply.push(0x03);
        let mut link = ScriptedLink::new(reply);
        assert!(matches!(
            query_power_meter(&mut link, "mock"),
            Err(TelemetryError::Protocol { received: 64, .. })
        ));
    }

    #[test]
    fn query_without_reply_is_device_error() {
        let mut link = ScriptedLink::new(Vec::new());
        assert!(matches!(
            query_power_meter(&mut link, "/dev/ttyUSB9"),
            Err(TelemetryError::DeviceIo { ref port, .. }) if port == "/dev/ttyUSB9"
        ));
    }

    #[test]
    fn opening_missing_port_is_device_error() {
        let meter = Eng110Meter::new(MeterConfig {
            port: "/nonexistent/powerbench-tty".to_string(),
            ..MeterConfig::default()
        });
        assert!(matches!(meter.query(), Err(TelemetryError::DeviceIo { .. })));
    }

    proptest! {
        #[test]
        fn readings_reencode_bit_exact(raw in prop::collection::vec(any::<u8>(), RESPONSE_LEN)) {
            let frame = decode_response(&raw).unwrap();
            let encoded = frame.sample.to_le_bytes();
            prop_assert_eq!(&encoded[..], &raw[VALUES_OFFSET..VALUES_END]);
            prop_assert_eq!(&frame.timestamp[..], &raw[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_LEN]);
        }
    }
}
