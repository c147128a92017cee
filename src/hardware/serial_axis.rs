//! Piezo linear stage over a serial line.
//!
//! Speaks the `TAG=VALUE` vocabulary in [`super::axis_protocol`]. Motion
//! commands are acknowledged immediately; completion is detected by polling
//! `STAT` until the moving bit clears.
//!
//! # Example Usage
//!
//! ```no_run
//! use tosca_daq::config::ActuatorConfig;
//! use tosca_daq::hardware::serial_axis::SerialAxis;
//! use tosca_daq::hardware::MotionAxis;
//! use tosca_daq::motion::Unit;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ActuatorConfig {
//!         port: Some("/dev/ttyUSB0".into()),
//!         ..ActuatorConfig::default()
//!     };
//!     let axis = SerialAxis::connect(&config).await?;
//!     axis.move_absolute(2.5, Unit::Millimeter).await?;
//!     println!("at {:.4} mm", axis.position(Unit::Millimeter).await?);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::axis_protocol::{exchange, AxisCommand, AxisReply, AxisStatus, UnitConverter};
use super::MotionAxis;
use crate::config::ActuatorConfig;
use crate::error::{AppResult, DaqError};
use crate::motion::{Direction, Unit};
use crate::session::{DeviceInfo, DeviceKind};

/// Time allowed for a single reply line.
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
/// Status polling interval while waiting for motion to settle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Serial stage driver.
pub struct SerialAxis {
    /// Port protected for exclusive use during a command/reply exchange
    port: Mutex<BufReader<SerialStream>>,
    info: DeviceInfo,
    converter: UnitConverter,
    command_timeout: Duration,
    home_timeout: Duration,
}

impl SerialAxis {
    /// Open `config.port` and verify the controller answers `IDN`.
    pub async fn connect(config: &ActuatorConfig) -> AppResult<Self> {
        let path = config
            .port
            .as_deref()
            .ok_or_else(|| DaqError::Configuration("actuator.port is not set".to_string()))?;
        let stream = tokio_serial::new(path, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DaqError::Hardware(format!("failed to open {path}: {e}")))?;

        let mut axis = Self {
            port: Mutex::new(BufReader::new(stream)),
            info: DeviceInfo::new(path, "unknown", "unknown", DeviceKind::Actuator),
            converter: UnitConverter::new(config.encoder_resolution_nm)?,
            command_timeout: config.command_timeout,
            home_timeout: config.home_timeout,
        };

        let reply = axis.transaction(AxisCommand::Identify).await?;
        let (model, serial) = reply.value.split_once(',').unwrap_or((reply.value.as_str(), ""));
        axis.info = DeviceInfo::new(
            config.device_id.as_deref().unwrap_or(path),
            model.trim(),
            serial.trim(),
            DeviceKind::Actuator,
        );
        info!(axis = %axis.info, port = path, baud = config.baud_rate, "Serial axis connected");
        Ok(axis)
    }

    /// Send `command` and read its reply.
    ///
    /// Replies stranded by an abandoned exchange are discarded here.
    async fn transaction(&self, command: AxisCommand) -> AppResult<AxisReply> {
        let mut port = self.port.lock().await;
        exchange(&mut *port, &command, REPLY_TIMEOUT).await
    }

    async fn status(&self) -> AppResult<AxisStatus> {
        let reply = self.transaction(AxisCommand::QueryStatus).await?;
        let bits = reply.as_i64()?;
        u32::try_from(bits)
            .map(AxisStatus)
            .map_err(|_| DaqError::Hardware(format!("status out of range: {bits}")))
    }

    /// Poll status until the stage stops moving.
    ///
    /// The port lock is only held per poll, so `stop_motion` can get through.
    async fn wait_settled(&self, operation: &str, limit: Duration) -> AppResult<()> {
        let deadline = Instant::now() + limit;
        loop {
            let status = self.status().await?;
            if status.has_error() {
                return Err(DaqError::Hardware(format!("{operation}: controller error latched")));
            }
            if !status.is_moving() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(operation, ?limit, "Axis did not settle; stopping");
                let _ = self.transaction(AxisCommand::Stop).await;
                return Err(DaqError::Timeout {
                    operation: operation.to_string(),
                    timeout: limit,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn move_and_settle(&self, command: AxisCommand, limit: Duration) -> AppResult<()> {
        self.transaction(command).await?;
        self.wait_settled(command.tag(), limit).await
    }
}

#[async_trait]
impl MotionAxis for SerialAxis {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn set_speed(&self, speed: f64, unit: Unit) -> AppResult<()> {
        let counts = self.converter.to_counts(speed, unit)?;
        if counts <= 0 {
            return Err(DaqError::InvalidStep(format!("speed {speed} {unit}/s rounds to zero counts")));
        }
        self.transaction(AxisCommand::SetSpeed(counts)).await?;
        debug!(counts, "Axis speed set");
        Ok(())
    }

    async fn move_absolute(&self, position: f64, unit: Unit) -> AppResult<()> {
        let counts = self.converter.to_counts(position, unit)?;
        self.move_and_settle(AxisCommand::MoveAbsolute(counts), self.command_timeout)
            .await
    }

    async fn move_relative(&self, distance: f64, unit: Unit) -> AppResult<()> {
        let counts = self.converter.to_counts(distance, unit)?;
        self.move_and_settle(AxisCommand::Step(counts), self.command_timeout)
            .await
    }

    async fn home(&self) -> AppResult<()> {
        self.move_and_settle(AxisCommand::FindIndex, self.home_timeout).await
    }

    async fn scan(&self, direction: Direction, duration: Duration) -> AppResult<()> {
        self.transaction(AxisCommand::StartScan(direction)).await?;
        sleep(duration).await;
        self.transaction(AxisCommand::StopScan).await?;
        self.wait_settled("SCAN", self.command_timeout).await
    }

    async fn stop_motion(&self) -> AppResult<()> {
        self.transaction(AxisCommand::Stop).await?;
        info!(axis = %self.info.id, "Axis stopped");
        Ok(())
    }

    async fn position(&self, unit: Unit) -> AppResult<f64> {
        let counts = self.transaction(AxisCommand::QueryPosition).await?.as_i64()?;
        Ok(self.converter.from_counts(counts, unit))
    }
}
