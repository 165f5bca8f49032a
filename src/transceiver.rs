//! C2: owns the serial port and the direction-enable line, serialises every transaction
//! through a single bus mutex, and enforces the timeout/guard timing from the RTU spec.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::codec::{build_request, parse_response, FrameError};
use crate::error::BusError;

#[derive(Debug, Clone, Copy)]
pub struct TransceiverConfig {
    pub response_timeout: Duration,
    pub drain_delay: Duration,
    pub direction_guard: Duration,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            drain_delay: Duration::from_millis(10),
            direction_guard: Duration::from_millis(1),
        }
    }
}

/// Guards the one shared serial port. The mutex is the bus: whoever holds it owns the
/// RS-485 line for the length of one transaction, nothing more.
pub struct Transceiver {
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    config: TransceiverConfig,
}

impl Transceiver {
    pub fn new(port: Box<dyn serialport::SerialPort>, config: TransceiverConfig) -> Self {
        Self {
            port: Arc::new(Mutex::new(port)),
            config,
        }
    }

    /// Sends `unit_id/function/payload` as one RTU frame and waits for the matching
    /// reply, holding the bus mutex for the whole round trip.
    pub async fn transact(&self, unit_id: u8, function: u8, payload: &[u8]) -> Result<Vec<u8>, BusError> {
        let frame = build_request(unit_id, function, payload);
        let mut guard = self.port.lock().await;

        // DE high: assert transmit, let the RS-485 driver turn on.
        let _ = guard.write_request_to_send(true);
        tokio::time::sleep(self.config.direction_guard).await;

        guard.write_all(&frame).map_err(|_| BusError::Timeout)?;
        tokio::time::sleep(self.config.drain_delay).await;

        // DE low: back to receive before anything can arrive.
        let _ = guard.write_request_to_send(false);
        tokio::time::sleep(self.config.direction_guard).await;

        let raw = receive(&mut **guard, self.config.response_timeout).await;
        drop(guard);

        let raw = raw.ok_or(BusError::Timeout)?;
        match parse_response(&raw, function) {
            Ok(payload) => Ok(payload.to_vec()),
            Err(FrameError::CrcMismatch) => Err(BusError::CrcMismatch),
            Err(FrameError::ShortFrame) | Err(FrameError::FunctionMismatch) => Err(BusError::FramingError),
            Err(FrameError::Exception(code)) => Err(BusError::Exception(code)),
        }
    }
}

/// Function codes with response lengths fully determined by the function code itself;
/// extending support means extending this table, per the design notes.
fn expected_length(buf: &[u8]) -> Option<usize> {
    let function = buf[1];
    if function & 0x80 != 0 {
        return Some(5);
    }
    match function {
        1..=4 => Some(3 + buf[2] as usize + 2),
        5 | 6 | 15 | 16 => Some(8),
        _ => None,
    }
}

async fn receive(port: &mut (dyn serialport::SerialPort), deadline_after: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + deadline_after;
    let mut buf = Vec::with_capacity(256);
    let mut scratch = [0u8; 64];
    loop {
        match port.read(&mut scratch) {
            Ok(0) => {}
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(ref e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => {}
            Err(_) => break,
        }
        if buf.len() >= 4 {
            if let Some(expected) = expected_length(&buf) {
                if buf.len() >= expected {
                    buf.truncate(expected);
                    return Some(buf);
                }
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_function_length_comes_from_byte_count() {
        // `01 03 04 ..` -> 3 header bytes + 4 data bytes + 2 crc bytes.
        assert_eq!(expected_length(&[0x01, 0x03, 0x04]), Some(9));
    }

    #[test]
    fn exception_reply_is_always_five_bytes() {
        assert_eq!(expected_length(&[0x01, 0x83, 0x02]), Some(5));
    }

    #[test]
    fn single_write_replies_are_fixed_length() {
        for function in [5u8, 6, 15, 16] {
            assert_eq!(expected_length(&[0x01, function, 0x00]), Some(8));
        }
    }

    #[test]
    fn default_timing_matches_design_defaults() {
        let config = TransceiverConfig::default();
        assert_eq!(config.response_timeout, Duration::from_millis(1000));
        assert_eq!(config.drain_delay, Duration::from_millis(10));
        assert_eq!(config.direction_guard, Duration::from_millis(1));
    }
}
