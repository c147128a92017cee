//! Line protocol for the piezo positioning stage.
//!
//! Protocol Overview:
//! - Format: `TAG=VALUE\n`, ASCII, half-duplex
//! - Quantities are integer encoder counts (speeds: counts per second)
//! - Every command is answered with `TAG=VALUE`; `ERROR=<code>` reports a failure
//! - Motion commands answer immediately; completion is observed by polling `STAT`
//!
//! | Command          | Encoding      | Reply            |
//! |------------------|---------------|------------------|
//! | identify         | `IDN=?`       | `IDN=<model>,<serial>` |
//! | set speed        | `SSPD=<cps>`  | `SSPD=<cps>`     |
//! | absolute move    | `DPOS=<cnt>`  | `DPOS=<cnt>`     |
//! | relative step    | `STEP=<cnt>`  | `STEP=<cnt>`     |
//! | index search     | `INDX=0`      | `INDX=0`         |
//! | scan start/stop  | `SCAN=1/-1/0` | `SCAN=<dir>`     |
//! | stop             | `STOP=0`      | `STOP=0`         |
//! | position         | `EPOS=?`      | `EPOS=<cnt>`     |
//! | status           | `STAT=?`      | `STAT=<bits>`    |
//!
//! An exchange can be cancelled between the write and the reply (a motion
//! step aborted mid-poll), so the reply may arrive during the next exchange.
//! [`exchange`] discards input already pending before it writes and skips
//! reply lines whose tag does not answer the command it sent.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::{AppResult, DaqError};
use crate::motion::{Direction, Unit};

/// Status bit: stage is moving.
pub const STATUS_MOVING: u32 = 0x01;
/// Status bit: index mark found since power-up.
pub const STATUS_HOMED: u32 = 0x02;
/// Status bit: controller error latched.
pub const STATUS_ERROR: u32 = 0x04;

/// A command in the stage vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisCommand {
    /// `IDN=?`
    Identify,
    /// `SSPD=<counts/s>`
    SetSpeed(i64),
    /// `DPOS=<counts>`
    MoveAbsolute(i64),
    /// `STEP=<counts>`
    Step(i64),
    /// `INDX=0`
    FindIndex,
    /// `SCAN=<1|-1>`
    StartScan(Direction),
    /// `SCAN=0`
    StopScan,
    /// `STOP=0`
    Stop,
    /// `EPOS=?`
    QueryPosition,
    /// `STAT=?`
    QueryStatus,
}

impl AxisCommand {
    /// Wire tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Identify => "IDN",
            Self::SetSpeed(_) => "SSPD",
            Self::MoveAbsolute(_) => "DPOS",
            Self::Step(_) => "STEP",
            Self::FindIndex => "INDX",
            Self::StartScan(_) | Self::StopScan => "SCAN",
            Self::Stop => "STOP",
            Self::QueryPosition => "EPOS",
            Self::QueryStatus => "STAT",
        }
    }

    /// Encoded line including the terminator.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }

    /// Whether completion must be awaited by polling status.
    pub fn starts_motion(&self) -> bool {
        matches!(
            self,
            Self::MoveAbsolute(_) | Self::Step(_) | Self::FindIndex | Self::StartScan(_)
        )
    }
}

impl fmt::Display for AxisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        match self {
            Self::Identify | Self::QueryPosition | Self::QueryStatus => write!(f, "{tag}=?"),
            Self::SetSpeed(v) | Self::MoveAbsolute(v) | Self::Step(v) => write!(f, "{tag}={v}"),
            Self::StartScan(direction) => write!(f, "{tag}={}", direction.sign()),
            Self::FindIndex | Self::StopScan | Self::Stop => write!(f, "{tag}=0"),
        }
    }
}

/// A parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisReply {
    /// Tag echoed by the controller
    pub tag: String,
    /// Value text
    pub value: String,
}

impl AxisReply {
    /// Parse the value as an integer.
    pub fn as_i64(&self) -> AppResult<i64> {
        self.value
            .parse()
            .map_err(|_| DaqError::Hardware(format!("{}: expected integer, got '{}'", self.tag, self.value)))
    }
}

/// Parse one reply line.
///
/// `ERROR=...` becomes [`DaqError::Hardware`].
pub fn parse_reply(line: &str) -> AppResult<AxisReply> {
    let line = line.trim();
    let (tag, value) = line
        .split_once('=')
        .ok_or_else(|| DaqError::Hardware(format!("malformed reply '{line}'")))?;
    if tag == "ERROR" {
        return Err(DaqError::Hardware(format!("controller error {value}")));
    }
    Ok(AxisReply {
        tag: tag.to_string(),
        value: value.to_string(),
    })
}

/// Discard input that is already waiting on `port`. Returns the byte count.
async fn discard_pending<P>(port: &mut BufReader<P>) -> AppResult<usize>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut discarded = 0;
    loop {
        // A zero timeout still polls the read once.
        let ready = match timeout(Duration::ZERO, port.fill_buf()).await {
            Ok(Ok(buf)) => buf.len(),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => 0,
        };
        if ready == 0 {
            return Ok(discarded);
        }
        port.consume(ready);
        discarded += ready;
    }
}

/// Send `command` on `port` and return the reply that answers it.
///
/// Stale lines (another tag, or a fragment of a line cut short by a
/// cancelled read) are skipped until `reply_timeout` runs out. `ERROR=...`
/// is taken as the answer to `command`.
pub async fn exchange<P>(
    port: &mut BufReader<P>,
    command: &AxisCommand,
    reply_timeout: Duration,
) -> AppResult<AxisReply>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let stale = discard_pending(port).await?;
    if stale > 0 {
        debug!(bytes = stale, command = %command, "Discarded stale axis input");
    }

    trace!(command = %command, "Axis TX");
    port.get_mut().write_all(command.encode().as_bytes()).await?;
    port.get_mut().flush().await?;

    let deadline = Instant::now() + reply_timeout;
    let mut line = String::new();
    loop {
        line.clear();
        let read = timeout_at(deadline, port.read_line(&mut line))
            .await
            .map_err(|_| DaqError::Timeout {
                operation: format!("reply to {}", command.tag()),
                timeout: reply_timeout,
            })??;
        if read == 0 {
            return Err(DaqError::Hardware("serial port closed".to_string()));
        }
        trace!(reply = line.trim(), "Axis RX");

        match parse_reply(&line) {
            Ok(reply) if reply.tag == command.tag() => return Ok(reply),
            Ok(reply) => debug!(
                expected = command.tag(),
                tag = %reply.tag,
                value = %reply.value,
                "Skipping stale axis reply"
            ),
            Err(DaqError::Hardware(reason)) if line.trim_start().starts_with("ERROR=") => {
                return Err(DaqError::Hardware(reason));
            }
            Err(_) => debug!(line = line.trim(), "Skipping malformed axis reply"),
        }
    }
}

/// Decoded `STAT` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisStatus(pub u32);

impl AxisStatus {
    /// Stage is moving.
    pub fn is_moving(self) -> bool {
        self.0 & STATUS_MOVING != 0
    }

    /// Index has been found.
    pub fn is_homed(self) -> bool {
        self.0 & STATUS_HOMED != 0
    }

    /// Error latched.
    pub fn has_error(self) -> bool {
        self.0 & STATUS_ERROR != 0
    }
}

/// Converts user units to encoder counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    encoder_resolution_nm: f64,
}

impl UnitConverter {
    /// Converter for an encoder with `encoder_resolution_nm` nanometres per count.
    pub fn new(encoder_resolution_nm: f64) -> AppResult<Self> {
        if !(encoder_resolution_nm.is_finite() && encoder_resolution_nm > 0.0) {
            return Err(DaqError::Configuration(format!(
                "encoder resolution must be positive, got {encoder_resolution_nm}"
            )));
        }
        Ok(Self { encoder_resolution_nm })
    }

    /// Nanometres per count.
    pub fn encoder_resolution_nm(&self) -> f64 {
        self.encoder_resolution_nm
    }

    /// `value` in `unit` as whole counts (rounded to nearest).
    pub fn to_counts(&self, value: f64, unit: Unit) -> AppResult<i64> {
        let counts = unit.to_nanometers(value, self.encoder_resolution_nm) / self.encoder_resolution_nm;
        if !counts.is_finite() || counts.abs() > i64::MAX as f64 {
            return Err(DaqError::InvalidStep(format!("{value} {unit} is out of range")));
        }
        Ok(counts.round() as i64)
    }

    /// `counts` expressed in `unit`.
    pub fn from_counts(&self, counts: i64, unit: Unit) -> f64 {
        unit.from_nanometers(counts as f64 * self.encoder_resolution_nm, self.encoder_resolution_nm)
    }

    /// Convert between units.
    pub fn convert(&self, value: f64, from: Unit, to: Unit) -> f64 {
        to.from_nanometers(from.to_nanometers(value, self.encoder_resolution_nm), self.encoder_resolution_nm)
    }
}
