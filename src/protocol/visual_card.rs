//! # Visual Card Command Protocol
//!
//! Request/response exchange with Star Visual Card (rewritable card) devices
//! over a bidirectional transport (serial or USB).
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────┬─────────┬──────────────┬─────┬─────┐
//! │ STX │ command │ data (0-128) │ ETX │ BCC │
//! └─────┴─────────┴──────────────┴─────┴─────┘
//!         └──────── XOR ─────────────┘
//! ```
//!
//! The response frame has the same shape with a status byte in place of the
//! command: `STX, cmd, status, data..., ETX, BCC`.
//!
//! ## Exchange
//!
//! 1. Send ACK to settle any frame left unacknowledged by an earlier timeout.
//! 2. Drain whatever is waiting in the input channel.
//! 3. Send the frame and wait for one reply byte: ACK proceeds, NAK resends,
//!    DLE means the device refused the command.
//! 4. With a fresh budget, collect the response until ETX is the second to
//!    last byte, verify BCC, answer ACK (good) or NAK (corrupt, retry).
//!
//! Both phases are bounded by the caller's timeout, charged with the measured
//! wall-clock time of every read attempt.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, StarIoError};
use crate::protocol::{ACK, DLE, ETX, NAK, STX};

/// Largest payload in either direction
pub const MAX_DATA_LEN: usize = 128;

/// STX + command + status + data + ETX + BCC
pub const MAX_FRAME_LEN: usize = 1 + 1 + 1 + MAX_DATA_LEN + 1 + 1;

/// Smallest well-formed response: STX, cmd, status, ETX, BCC
const MIN_RESPONSE_LEN: usize = 5;

/// Per-read wait while draining stale input
const DRAIN_WAIT: Duration = Duration::from_millis(10);

/// Pause after NAKing a corrupt response
const NAK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// # Visual Card Command
///
/// The application fills `command` and `tx_data`; a successful exchange
/// returns a copy with `status` and `rx_data` set from the device's reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisualCardCommand {
    pub command: u8,
    pub tx_data: Vec<u8>,
    pub status: u8,
    pub rx_data: Vec<u8>,
}

impl VisualCardCommand {
    pub fn new(command: u8, tx_data: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            tx_data: tx_data.into(),
            ..Default::default()
        }
    }
}

/// A bidirectional byte channel to a Visual Card device.
pub trait CardChannel {
    /// Write bytes, returning how many were accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Read into `buf`, waiting up to `wait` for at least `min_len` bytes.
    ///
    /// `Ok(0)` or any error other than `NotOpen` counts as "nothing arrived".
    fn receive(&mut self, buf: &mut [u8], min_len: usize, wait: Duration) -> Result<usize>;

    /// Extra pause charged to the budget after a read that returned nothing.
    fn idle_pause(&self) -> Duration {
        Duration::ZERO
    }
}

// ============================================================================
// FRAMING
// ============================================================================

/// XOR of every byte
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// # Encode a Command Frame
///
/// ## Example
///
/// ```
/// use stario::protocol::visual_card::encode_frame;
///
/// let frame = encode_frame(0x46, b"1");
/// assert_eq!(frame, vec![0x02, 0x46, 0x31, 0x03, 0x46 ^ 0x31 ^ 0x03]);
/// ```
pub fn encode_frame(command: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 4);
    frame.push(STX);
    frame.push(command);
    frame.extend_from_slice(data);
    frame.push(ETX);
    frame.push(checksum(&frame[1..]));
    frame
}

/// Whether `frame` ends with ETX followed by one more byte.
fn is_complete(frame: &[u8]) -> bool {
    frame.len() >= MIN_RESPONSE_LEN && frame[frame.len() - 2] == ETX
}

/// Split a response frame into `(status, data)` if its BCC checks out.
pub fn parse_response(frame: &[u8]) -> Option<(u8, Vec<u8>)> {
    if !is_complete(frame) {
        return None;
    }

    let len = frame.len();
    if checksum(&frame[1..len - 1]) != frame[len - 1] {
        return None;
    }

    Some((frame[2], frame[3..len - 2].to_vec()))
}

// ============================================================================
// TIME BUDGET
// ============================================================================

struct Budget {
    remaining: Duration,
}

impl Budget {
    fn new(total: Duration) -> Self {
        Self { remaining: total }
    }

    fn exhausted(&self) -> bool {
        self.remaining.is_zero()
    }

    fn charge(&mut self, elapsed: Duration) {
        self.remaining = self.remaining.saturating_sub(elapsed);
    }

    /// Sleep for `delay` if the budget covers it, otherwise use it up.
    fn pause(&mut self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        if self.remaining > delay {
            thread::sleep(delay);
            self.remaining -= delay;
        } else {
            self.remaining = Duration::ZERO;
        }
    }
}

/// One read attempt; returns the byte count (0 for "nothing") and its
/// wall-clock duration.
fn timed_receive<C: CardChannel + ?Sized>(
    channel: &mut C,
    buf: &mut [u8],
    min_len: usize,
    wait: Duration,
) -> Result<(usize, Duration)> {
    let start = Instant::now();
    let count = match channel.receive(buf, min_len, wait) {
        Ok(count) => count,
        Err(e) if e.is_not_open() => return Err(e),
        Err(_) => 0,
    };
    Ok((count, start.elapsed()))
}

fn send_exact<C: CardChannel + ?Sized>(channel: &mut C, data: &[u8]) -> Result<()> {
    let sent = channel.send(data)?;
    if sent != data.len() {
        return Err(StarIoError::IoFail(format!(
            "short write: {} of {} bytes",
            sent,
            data.len()
        )));
    }
    Ok(())
}

// ============================================================================
// EXCHANGE
// ============================================================================

/// # Execute One Visual Card Command
///
/// ## Errors
///
/// - `Rejected`: device answered DLE
/// - `Nak`: device was still NAKing the frame when the budget ran out
/// - `NoResponse`: nothing (or no complete response) arrived in time
/// - `IoFail`: short write, unexpected reply byte, or corrupt responses
///   until the budget ran out
/// - `NotAvailable`: payload longer than 128 bytes
/// - `NotOpen`: the device went away
pub fn execute<C: CardChannel + ?Sized>(
    channel: &mut C,
    request: &VisualCardCommand,
    timeout: Duration,
) -> Result<VisualCardCommand> {
    if request.tx_data.len() > MAX_DATA_LEN {
        return Err(StarIoError::NotAvailable(format!(
            "card payload of {} bytes exceeds {}",
            request.tx_data.len(),
            MAX_DATA_LEN
        )));
    }

    send_exact(channel, &[ACK])?;
    drain_input(channel)?;

    let frame = encode_frame(request.command, &request.tx_data);
    transmit(channel, &frame, timeout)?;

    let (status, rx_data) = collect_response(channel, timeout)?;
    debug!(command = request.command, status, len = rx_data.len(), "card response");

    Ok(VisualCardCommand {
        command: request.command,
        tx_data: request.tx_data.clone(),
        status,
        rx_data,
    })
}

fn drain_input<C: CardChannel + ?Sized>(channel: &mut C) -> Result<()> {
    let mut scratch = [0u8; MAX_FRAME_LEN];
    loop {
        let (count, _) = timed_receive(channel, &mut scratch, 1, DRAIN_WAIT)?;
        if count == 0 {
            return Ok(());
        }
        debug!(count, "discarded stale input");
    }
}

/// Send the frame until the device ACKs it.
fn transmit<C: CardChannel + ?Sized>(
    channel: &mut C,
    frame: &[u8],
    timeout: Duration,
) -> Result<()> {
    let mut budget = Budget::new(timeout);
    let mut last_reply = None;

    'resend: while !budget.exhausted() {
        send_exact(channel, frame)?;

        while !budget.exhausted() {
            let mut reply = [0u8; 1];
            let (count, elapsed) = timed_receive(channel, &mut reply, 1, budget.remaining)?;
            budget.charge(elapsed);

            if count == 0 {
                budget.pause(channel.idle_pause());
                continue;
            }

            last_reply = Some(reply[0]);
            match reply[0] {
                ACK => return Ok(()),
                NAK => {
                    warn!("device NAKed command frame, resending");
                    continue 'resend;
                }
                DLE => return Err(StarIoError::Rejected),
                other => {
                    return Err(StarIoError::IoFail(format!(
                        "unexpected reply byte {:#04x}",
                        other
                    )));
                }
            }
        }
    }

    if last_reply == Some(NAK) {
        Err(StarIoError::Nak)
    } else {
        Err(StarIoError::NoResponse)
    }
}

/// Read, verify and acknowledge the response frame.
fn collect_response<C: CardChannel + ?Sized>(
    channel: &mut C,
    timeout: Duration,
) -> Result<(u8, Vec<u8>)> {
    let mut budget = Budget::new(timeout);

    while !budget.exhausted() {
        let mut rx = [0u8; MAX_FRAME_LEN];
        let mut len = 0;

        let complete = loop {
            if budget.exhausted() {
                break false;
            }

            let min_len = MIN_RESPONSE_LEN.saturating_sub(len).max(1);
            let (count, elapsed) =
                timed_receive(channel, &mut rx[len..], min_len, budget.remaining)?;
            len += count;
            budget.charge(elapsed);

            // A full buffer without ETX goes to the checksum step and gets NAKed
            if is_complete(&rx[..len]) || len == MAX_FRAME_LEN {
                break true;
            }

            if count == 0 {
                budget.pause(channel.idle_pause());
            }
        };

        if !complete {
            return Err(StarIoError::NoResponse);
        }

        if let Some(response) = parse_response(&rx[..len]) {
            send_exact(channel, &[ACK])?;
            return Ok(response);
        }

        warn!(len, "corrupt card response, sending NAK");
        send_exact(channel, &[NAK])?;
        budget.pause(NAK_RETRY_DELAY);
    }

    Err(StarIoError::IoFail(
        "card response failed checksum until timeout".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
