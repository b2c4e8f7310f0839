//! Serial UART LIN transceiver
//!
//! Drives a LIN transceiver chip attached to a plain UART (USB adapter or
//! on-board). The break is produced with the UART break condition; the
//! receive line sees our own header echoed back.

use crate::error::TransceiverError;
use crate::frame::{FrameId, SYNC_BYTE};
use crate::transceiver::{bit_times, BusTransceiver, RxBuffer, BREAK_BIT_TIMES};
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// LIN default baud rate for body electronics
pub const DEFAULT_BAUD: u32 = 19_200;

pub struct SerialTransceiver {
    port: Box<dyn SerialPort>,
    break_duration: Duration,
    delimiter: Duration,
}

impl SerialTransceiver {
    /// Open a serial port by path, 8N1, no flow control
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransceiverError> {
        info!("Opening {} at {} baud", path, baud_rate);

        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(1))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        port.clear(ClearBuffer::All)?;

        Ok(Self {
            port,
            // one extra bit time of margin on the dominant phase
            break_duration: bit_times(BREAK_BIT_TIMES + 1, baud_rate),
            delimiter: bit_times(1, baud_rate),
        })
    }

    fn delay(duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransceiverError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }
}

impl BusTransceiver for SerialTransceiver {
    fn purge_rx(&mut self) -> Result<(), TransceiverError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn send_break_sync_id(&mut self, id: FrameId) -> Result<u8, TransceiverError> {
        let pid = id.pid();

        self.port.set_break()?;
        Self::delay(self.break_duration);
        self.port.clear_break()?;
        Self::delay(self.delimiter);

        self.write(&[SYNC_BYTE, pid])?;
        Ok(pid)
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), TransceiverError> {
        self.write(&[byte])
    }

    fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransceiverError> {
        let start = Instant::now();
        let mut rx = RxBuffer::new(max_len);
        let mut chunk = [0u8; 16];

        while start.elapsed() < timeout && !rx.is_full() {
            let available = self.port.bytes_to_read()? as usize;

            if available > 0 {
                let to_read = available.min(rx.remaining()).min(chunk.len());
                match self.port.read(&mut chunk[..to_read]) {
                    Ok(n) => rx.push(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                // Keep the poll tight; LIN bytes arrive every ~520us at 19200
                thread::sleep(Duration::from_micros(100));
            }
        }

        let buffer = rx.into_bytes();
        if !buffer.is_empty() {
            debug!("RX: {:02X?}", buffer);
        }
        Ok(buffer)
    }
}
