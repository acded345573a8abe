// SPDX-License-Identifier: GPL-3.0-only

//! Hardware trigger controller
//!
//! A microcontroller on a serial link emits synchronized exposure pulses on a
//! set of digital pins. The link is fire-and-continue: one command starts the
//! pulse train, the same command with a rate of `-1` stops it, and nothing is
//! acknowledged per frame.

use crate::config::TriggerConfig;
use crate::constants::{timing, trigger};
use crate::errors::AppError;
use serialport::SerialPort;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

/// Start/stop handshake with a pulse generator
pub trait TriggerController: Send {
    /// Start pulsing `pins` at `frame_rate` Hz
    fn start(&mut self, frame_rate: f64, pins: &[u8]) -> Result<(), AppError>;

    /// Stop pulsing and release the link
    fn stop(&mut self) -> Result<(), AppError>;
}

/// Serialize a trigger command: `<pin count>,<pins...>,<rate>`
pub fn trigger_command(pins: &[u8], frame_rate: f64) -> String {
    let mut fields = Vec::with_capacity(pins.len() + 2);
    fields.push(pins.len().to_string());
    fields.extend(pins.iter().map(|p| p.to_string()));
    fields.push(frame_rate.to_string());
    fields.join(",")
}

/// Arduino running the pulse-train sketch
pub struct ArduinoTrigger {
    port_name: String,
    init_delay: Duration,
    port: Option<Box<dyn SerialPort>>,
    pins: Vec<u8>,
}

impl ArduinoTrigger {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            init_delay: timing::ARDUINO_INIT_DELAY,
            port: None,
            pins: Vec::new(),
        }
    }

    fn send(&mut self, command: &str) -> Result<(), AppError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| AppError::Trigger("serial port is not open".to_string()))?;
        port.write_all(command.as_bytes())
            .and_then(|_| port.flush())
            .map_err(|e| AppError::Trigger(format!("{}: {}", self.port_name, e)))?;
        debug!(port = %self.port_name, command, "Sent trigger command");
        Ok(())
    }
}

impl TriggerController for ArduinoTrigger {
    fn start(&mut self, frame_rate: f64, pins: &[u8]) -> Result<(), AppError> {
        let port = serialport::new(&self.port_name, trigger::BAUD_RATE)
            .timeout(Duration::from_millis(trigger::SERIAL_TIMEOUT_MS))
            .open()
            .map_err(|e| AppError::Trigger(format!("opening {}: {}", self.port_name, e)))?;
        self.port = Some(port);

        // Opening the port resets the board
        std::thread::sleep(self.init_delay);

        self.pins = pins.to_vec();
        self.send(&trigger_command(pins, frame_rate))?;
        info!(
            port = %self.port_name,
            pins = ?pins,
            frame_rate,
            "Arduino is triggering"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AppError> {
        if self.port.is_none() {
            return Ok(());
        }
        let command = trigger_command(&self.pins, -1.0);
        let result = self.send(&command);
        self.port = None;
        info!(port = %self.port_name, "Closed trigger serial connection");
        result
    }
}

/// Build the controller named in the config
pub fn get_trigger(config: &TriggerConfig) -> Box<dyn TriggerController> {
    Box::new(ArduinoTrigger::new(&config.serial_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_format() {
        assert_eq!(trigger_command(&[0, 1, 2], 100.0), "3,0,1,2,100");
        assert_eq!(trigger_command(&[0, 1, 2], -1.0), "3,0,1,2,-1");
        assert_eq!(trigger_command(&[5], 59.5), "1,5,59.5");
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut trigger = ArduinoTrigger::new("/dev/null-port");
        assert!(trigger.stop().is_ok());
    }
}
