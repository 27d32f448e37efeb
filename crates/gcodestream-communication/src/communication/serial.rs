//! Serial port transport
//!
//! Provides the serial port implementation of [`Transport`] for direct
//! hardware connection to printers and other G-code devices via USB or
//! RS-232.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Baud rate, parity, stop bit and flow control configuration
//! - Line-buffered reads with a per-call timeout

use super::{ConnectionParams, SerialParity, Transport};
use gcodestream_core::{Error, Result, TransportError};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Upper bound of a single blocking read on the port
const READ_SLICE: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports that look like printer or controller connections
///
/// Filters to the usual device patterns:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_device_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb_info) => {
                    let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                    if let Some(ref mfg) = usb_info.manufacturer {
                        info = info.with_manufacturer(mfg);
                    }
                    if let Some(ref serial) = usb_info.serial_number {
                        info = info.with_serial_number(serial);
                    }
                    info
                }
                _ => info,
            }
        })
        .collect())
}

/// Check if a port name matches the device patterns of [`list_ports`]
pub fn is_device_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

fn open_failed(params: &ConnectionParams, reason: impl Into<String>) -> TransportError {
    TransportError::OpenFailed {
        path: params.port.clone(),
        reason: reason.into(),
    }
}

/// Serial port transport using the `serialport` crate
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Create a closed transport
    pub fn new() -> Self {
        Self::default()
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        )
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, params: &ConnectionParams) -> std::result::Result<(), TransportError> {
        if params.baud_rate == 0 {
            return Err(TransportError::UnsupportedBaudRate {
                baud: params.baud_rate,
            });
        }

        let data_bits = match params.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => return Err(open_failed(params, format!("Invalid data bits: {}", other))),
        };
        let stop_bits = match params.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => return Err(open_failed(params, format!("Invalid stop bits: {}", other))),
        };

        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(READ_SLICE)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(to_serialport_parity(params.parity))
            .flow_control(if params.flow_control {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            })
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                open_failed(params, e.to_string())
            })?;

        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            tracing::debug!("Could not clear buffers of {}: {}", params.port, e);
        }

        tracing::info!("Opened {} at {} baud", params.port, params.baud_rate);
        self.name = params.port.clone();
        self.pending.clear();
        self.port = Some(port);
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> std::result::Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        port.write_all(line)?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> std::result::Result<Option<String>, TransportError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(Some(line));
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(TransportError::Closed {
                        reason: e.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("Closed {}", self.name);
        }
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn name(&self) -> &str {
        if self.name.is_empty() {
            "serial"
        } else {
            &self.name
        }
    }
}
