//! Feetech STS serial bus framing
//!
//! Packet format: `[0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]`
//! where `Length = params + 2` and the checksum is the inverted low byte of
//! `ID + Length + Instruction + sum(Params)`.

use std::io::{self, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use serialport::{ClearBuffer, SerialPort};

use crate::{Error, Result};

/// Instruction codes used by the arm adapter
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// Register addresses
pub mod registers {
    pub const TORQUE_ENABLE: u8 = 0x28;
    pub const GOAL_POSITION: u8 = 0x2A;
    pub const PRESENT_POSITION: u8 = 0x38;
}

/// Broadcast ID for sync commands
pub const BROADCAST_ID: u8 = 0xFE;

/// Encoder steps per revolution
pub const STEPS_PER_REV: f64 = 4096.0;

/// Encoder reading at 0 rad
pub const CENTER_STEP: f64 = 2048.0;

/// Highest raw encoder reading
pub const MAX_STEP: u16 = 4095;

const MAX_PACKET: usize = 128;

/// Convert a raw encoder step to radians
pub fn step_to_radians(raw: u16) -> f64 {
    (f64::from(raw) - CENTER_STEP) * std::f64::consts::TAU / STEPS_PER_REV
}

/// Convert radians to a raw encoder step, saturating at the encoder range
pub fn radians_to_step(radians: f64) -> u16 {
    let raw = (radians * STEPS_PER_REV / std::f64::consts::TAU + CENTER_STEP).round();
    raw.clamp(0.0, f64::from(MAX_STEP)) as u16
}

fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build an instruction packet
pub fn build_packet(
    id: u8,
    instruction: Instruction,
    params: &[u8],
) -> Result<ArrayVec<u8, MAX_PACKET>> {
    if params.len() + 6 > MAX_PACKET {
        return Err(Error::Hardware(format!(
            "packet params too long: {} bytes",
            params.len()
        )));
    }
    let mut packet = ArrayVec::<u8, MAX_PACKET>::new();
    packet.push(0xFF);
    packet.push(0xFF);
    packet.push(id);
    packet.push((params.len() + 2) as u8);
    packet.push(instruction as u8);
    packet
        .try_extend_from_slice(params)
        .map_err(|_| Error::Hardware("packet overflow".into()))?;
    let sum = checksum(&packet[2..]);
    packet.push(sum);
    Ok(packet)
}

/// Byte stream a [`FeetechBus`] runs over
pub trait BusPort: Read + Write {
    /// Drop bytes received but not yet read
    fn discard_input(&mut self) -> io::Result<()>;
}

impl BusPort for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Blocking Feetech bus over any [`BusPort`]
pub struct FeetechBus<S> {
    port: S,
    timeout: Duration,
}

impl<S: BusPort> FeetechBus<S> {
    /// Wrap a byte stream
    pub fn new(port: S, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    fn read_exact_timeout(&mut self, buf: &mut [u8]) -> Result<()> {
        let start = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            if start.elapsed() > self.timeout {
                return Err(Error::Hardware(format!(
                    "read timeout: got {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => std::thread::sleep(Duration::from_micros(100)),
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    std::thread::sleep(Duration::from_micros(100))
                }
                Err(e) => return Err(Error::Hardware(format!("read error: {}", e))),
            }
        }
        Ok(())
    }

    /// Read one status packet, returning `(id, params)` with the error byte checked
    fn read_status(&mut self) -> Result<(u8, ArrayVec<u8, 16>)> {
        let mut header = [0u8; 4];
        self.read_exact_timeout(&mut header)?;
        if header[0] != 0xFF || header[1] != 0xFF {
            return Err(Error::Hardware("invalid status header".into()));
        }
        let id = header[2];
        let length = header[3] as usize;
        if !(2..=17).contains(&length) {
            return Err(Error::Hardware(format!("invalid status length {}", length)));
        }

        let mut body = [0u8; 17];
        self.read_exact_timeout(&mut body[..length])?;

        let mut summed = ArrayVec::<u8, 20>::new();
        summed.push(id);
        summed.push(header[3]);
        summed
            .try_extend_from_slice(&body[..length - 1])
            .map_err(|_| Error::Hardware("status overflow".into()))?;
        if checksum(&summed) != body[length - 1] {
            return Err(Error::Hardware(format!("checksum mismatch from servo {}", id)));
        }
        if body[0] != 0 {
            return Err(Error::Hardware(format!(
                "servo {} reported error 0x{:02X}",
                id, body[0]
            )));
        }

        let mut params = ArrayVec::new();
        params
            .try_extend_from_slice(&body[1..length - 1])
            .map_err(|_| Error::Hardware("status overflow".into()))?;
        Ok((id, params))
    }

    fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port
            .write_all(packet)
            .map_err(|e| Error::Hardware(format!("write failed: {}", e)))
    }

    /// Write a packet that expects status replies
    ///
    /// Leftovers from an earlier timed-out reply are discarded first so
    /// they cannot be parsed as this request's answer.
    fn request(&mut self, packet: &[u8]) -> Result<()> {
        if let Err(e) = self.port.discard_input() {
            tracing::debug!("Failed to discard stale input: {}", e);
        }
        self.write_packet(packet)
    }

    /// Ping a servo; `Ok(false)` when it does not answer
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        self.request(&build_packet(id, Instruction::Ping, &[])?)?;
        Ok(self.read_status().is_ok())
    }

    /// Read present positions of `ids` with one sync-read request
    pub fn sync_read_positions(&mut self, ids: &[u8]) -> Result<ArrayVec<u16, 8>> {
        let mut params = ArrayVec::<u8, 16>::new();
        params.push(registers::PRESENT_POSITION);
        params.push(2);
        params
            .try_extend_from_slice(ids)
            .map_err(|_| Error::Hardware("too many servo ids".into()))?;
        self.request(&build_packet(BROADCAST_ID, Instruction::SyncRead, &params)?)?;

        let mut positions = ArrayVec::new();
        for &expected in ids {
            let (id, data) = self.read_status()?;
            if id != expected || data.len() < 2 {
                return Err(Error::Hardware(format!(
                    "unexpected sync-read reply from servo {} (wanted {})",
                    id, expected
                )));
            }
            positions
                .try_push(u16::from_le_bytes([data[0], data[1]]))
                .map_err(|_| Error::Hardware("too many servo ids".into()))?;
        }
        Ok(positions)
    }

    /// Write goal positions to `ids` with one sync-write (no reply)
    pub fn sync_write_positions(&mut self, ids: &[u8], positions: &[u16]) -> Result<()> {
        if ids.len() != positions.len() {
            return Err(Error::Hardware("ID and position count mismatch".into()));
        }
        let mut params = ArrayVec::<u8, 64>::new();
        params.push(registers::GOAL_POSITION);
        params.push(2);
        for (&id, &pos) in ids.iter().zip(positions) {
            let [lo, hi] = pos.to_le_bytes();
            params
                .try_extend_from_slice(&[id, lo, hi])
                .map_err(|_| Error::Hardware("too many servo ids".into()))?;
        }
        self.write_packet(&build_packet(BROADCAST_ID, Instruction::SyncWrite, &params)?)
    }

    /// Enable or disable torque on `ids` with one sync-write
    pub fn set_torque(&mut self, ids: &[u8], enabled: bool) -> Result<()> {
        let mut params = ArrayVec::<u8, 32>::new();
        params.push(registers::TORQUE_ENABLE);
        params.push(1);
        for &id in ids {
            params
                .try_extend_from_slice(&[id, u8::from(enabled)])
                .map_err(|_| Error::Hardware("too many servo ids".into()))?;
        }
        self.write_packet(&build_packet(BROADCAST_ID, Instruction::SyncWrite, &params)?)
    }
}
