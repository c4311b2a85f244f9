//! Serial transport implementation

use super::Transport;
use crate::config::{FlowSetting, ServerConfig};
use crate::error::{PumpError, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// Serial transport for the RS-485 adapter
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open a serial port with the line settings of the server configuration
    pub fn open(path: &str, settings: &ServerConfig) -> Result<Self> {
        let port = serialport::new(path, settings.baudrate)
            .data_bits(data_bits(settings.bytesize)?)
            .parity(parity(&settings.parity)?)
            .stop_bits(stop_bits(settings.stopbits)?)
            .flow_control(match settings.flowcontrol {
                FlowSetting::None => FlowControl::None,
                FlowSetting::Software => FlowControl::Software,
                FlowSetting::Hardware => FlowControl::Hardware,
            })
            .timeout(Duration::from_millis(settings.timeout_ms))
            .open()?;

        log::info!("Opened serial port: {} at {} baud", path, settings.baudrate);

        Ok(SerialTransport {
            port,
            name: path.to_string(),
        })
    }

    /// List available serial ports
    pub fn list_ports() -> Result<Vec<String>> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }
}

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(PumpError::InvalidArgument(format!("byte size {}", other))),
    }
}

fn parity(code: &str) -> Result<Parity> {
    match code {
        "N" | "n" | "none" => Ok(Parity::None),
        "E" | "e" | "even" => Ok(Parity::Even),
        "O" | "o" | "odd" => Ok(Parity::Odd),
        other => Err(PumpError::InvalidArgument(format!("parity {}", other))),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(PumpError::InvalidArgument(format!("stop bits {}", other))),
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
