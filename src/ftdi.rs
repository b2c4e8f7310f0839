//! FTDI D2XX LIN Transceiver
//!
//! Direct D2XX control of an FTDI UART wired to a LIN transceiver. Uses the
//! chip's break control for the header and the 1ms latency timer for fast
//! slave-response capture.

use crate::error::TransceiverError;
use crate::frame::{FrameId, SYNC_BYTE};
use crate::transceiver::{bit_times, BusTransceiver, RxBuffer, BREAK_BIT_TIMES};
use libftd2xx::{list_devices as ftdi_list, Ftdi, FtdiCommon};
use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// FTDI device information
#[derive(Debug, Clone)]
pub struct FtdiDevice {
    pub index: usize,
    pub description: String,
    pub serial_number: String,
}

fn device_err<E: Display>(e: E) -> TransceiverError {
    TransceiverError::Device(e.to_string())
}

/// List all available FTDI devices
pub fn list_devices() -> Result<Vec<FtdiDevice>, TransceiverError> {
    let devices = ftdi_list().map_err(device_err)?;

    Ok(devices
        .into_iter()
        .enumerate()
        .map(|(i, info)| FtdiDevice {
            index: i,
            description: info.description,
            serial_number: info.serial_number,
        })
        .collect())
}

/// FTDI connection configured as a LIN master
pub struct FtdiTransceiver {
    device: Ftdi,
    baud_rate: u32,
    connected: bool,
}

impl FtdiTransceiver {
    /// Open FTDI device by index (0 = first device)
    pub fn open(index: i32, baud_rate: u32) -> Result<Self, TransceiverError> {
        info!("Opening FTDI device index {}...", index);
        let device = Ftdi::with_index(index).map_err(device_err)?;
        Self::configure(device, baud_rate)
    }

    /// LIN framing: 8 data bits, 1 stop bit, no parity, no flow control
    fn configure(mut device: Ftdi, baud_rate: u32) -> Result<Self, TransceiverError> {
        device.reset().map_err(device_err)?;
        device
            .set_timeouts(Duration::from_millis(100), Duration::from_millis(100))
            .map_err(device_err)?;
        device.set_baud_rate(baud_rate).map_err(device_err)?;
        device
            .set_data_characteristics(
                libftd2xx::BitsPerWord::Bits8,
                libftd2xx::StopBits::Bits1,
                libftd2xx::Parity::No,
            )
            .map_err(device_err)?;
        device.set_flow_control_none().map_err(device_err)?;
        // Minimum latency so a slave response is delivered as soon as it lands
        device
            .set_latency_timer(Duration::from_millis(1))
            .map_err(device_err)?;
        device.purge_all().map_err(device_err)?;

        info!("FTDI device configured for LIN at {} baud", baud_rate);

        Ok(Self {
            device,
            baud_rate,
            connected: true,
        })
    }

    fn delay(duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransceiverError> {
        self.device.write_all(data).map_err(device_err)
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<(), TransceiverError> {
        if self.connected {
            info!("Closing FTDI connection");
            self.device.close().map_err(device_err)?;
            self.connected = false;
        }
        Ok(())
    }
}

impl BusTransceiver for FtdiTransceiver {
    fn purge_rx(&mut self) -> Result<(), TransceiverError> {
        self.device.purge_rx().map_err(device_err)
    }

    fn send_break_sync_id(&mut self, id: FrameId) -> Result<u8, TransceiverError> {
        let pid = id.pid();

        self.device.set_break_on().map_err(device_err)?;
        Self::delay(bit_times(BREAK_BIT_TIMES + 1, self.baud_rate));
        self.device.set_break_off().map_err(device_err)?;
        Self::delay(bit_times(1, self.baud_rate));

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
            let queue_status = self.device.queue_status().map_err(device_err)?;

            if queue_status > 0 {
                let to_read = queue_status.min(rx.remaining()).min(chunk.len());
                let read = self.device.read(&mut chunk[..to_read]).map_err(device_err)?;
                rx.push(&chunk[..read]);
            } else {
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

impl Drop for FtdiTransceiver {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
