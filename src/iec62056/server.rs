//! IEC 62056-21 mode C test server.
//!
//! Mirrors the client: answers the login with an identification, honours
//! the option select (switching baud rate like a real meter), transmits
//! the data readout or serves programming-mode read commands from a
//! pluggable data provider.
//!
//! The protocol machine is pure: [`ModeCServer::feed_byte`] consumes wire
//! bytes and emits [`Action`]s, so every exchange can be tested without a
//! serial port. [`ServerRunner`] binds the machine to a real (or proxied)
//! device and enforces the inactivity timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::iec62056::{baud_rate_from_char, bcc, control, format_bytes_for_display};
use crate::{Error, Result};

/// Keep at most this many bytes while waiting for a valid request, so
/// line noise cannot grow the buffer without bound.
const REQUEST_BUFFER_LIMIT: usize = 37;

/// Meter addresses may be up to 32 printable characters.
const ADDRESS_LIMIT: usize = 32;

/// Serves register values to the protocol machine.
pub trait DataProvider {
    /// Datasets for the readout message, in transmission order.
    fn addresses_for_readout(&self) -> Vec<String>;

    /// Value and optional unit for one register, or None when unknown.
    fn dataset(&self, address: &str) -> Option<(String, Option<String>)>;

    /// Whether a login request for this (zero-stripped) address is ours.
    /// The empty address is the broadcast form.
    fn accept_address(&self, _address: &str) -> bool {
        true
    }
}

/// In-memory provider with the register set of a small ME162.
#[derive(Debug, Default)]
pub struct Me162DataProvider {
    registers: HashMap<String, (String, Option<String>)>,
    readout_order: Vec<String>,
}

impl Me162DataProvider {
    pub fn new(registers: Vec<(&str, &str, Option<&str>)>) -> Self {
        let readout_order = registers.iter().map(|(a, _, _)| a.to_string()).collect();
        let registers = registers
            .into_iter()
            .map(|(a, v, u)| (a.to_string(), (v.to_string(), u.map(str::to_string))))
            .collect();
        Self {
            registers,
            readout_order,
        }
    }

    /// The register snapshot used by the sample server.
    pub fn sample() -> Self {
        Self::new(vec![
            ("C.1.0", "12345678", None),
            ("0.0.0", "47983850", None),
            ("1.8.0", "0034204.753", Some("kWh")),
            ("1.8.1", "0000000.000", Some("kWh")),
            ("1.8.2", "0034204.753", Some("kWh")),
            ("2.8.0", "0001516.488", Some("kWh")),
            ("2.8.1", "0000000.000", Some("kWh")),
            ("2.8.2", "0001516.488", Some("kWh")),
            ("F.F", "0000000", None),
        ])
    }
}

impl DataProvider for Me162DataProvider {
    fn addresses_for_readout(&self) -> Vec<String> {
        self.readout_order.clone()
    }

    fn dataset(&self, address: &str) -> Option<(String, Option<String>)> {
        self.registers.get(address).cloned()
    }
}

/// Protocol machine states. Transmissions happen on the way into a state,
/// so only the receiving states are materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Awaiting `/?ADDR!\r\n` at 300 baud.
    RecvRequestMessage,
    /// Identification sent, awaiting `ACK V Z Y \r\n`.
    RecvAckOptSelect,
    /// Readout sent, awaiting NAK (repeat) or a break.
    RecvCmdInDataReadout,
    /// Programming mode, awaiting SOH-framed commands.
    RecvCmdInProgramming,
}

/// What the runner must do after feeding bytes: transmit and/or change
/// the line speed. Baud switches take effect before any later send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Vec<u8>),
    SetBaud(u32),
}

pub struct ModeCServer<P: DataProvider> {
    provider: P,
    /// Identification string after the leading slash, e.g. `ISK5ME162-0033`.
    ident: String,
    state: ServerState,
    buf: Vec<u8>,
    /// Last frame we transmitted, so a NAK can ask for it again.
    last_reply: Option<Vec<u8>>,
}

impl<P: DataProvider> ModeCServer<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            ident: "ISK5ME162-0033".to_string(),
            state: ServerState::RecvRequestMessage,
            buf: Vec::new(),
            last_reply: None,
        }
    }

    pub fn with_ident(provider: P, ident: &str) -> Self {
        Self {
            ident: ident.to_string(),
            ..Self::new(provider)
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_initial(&self) -> bool {
        self.state == ServerState::RecvRequestMessage
    }

    /// Consume one wire byte, appending resulting actions to `out`.
    pub fn feed_byte(&mut self, byte: u8, out: &mut Vec<Action>) {
        match self.state {
            ServerState::RecvRequestMessage => self.feed_request(byte, out),
            ServerState::RecvAckOptSelect => self.feed_opt_select(byte, out),
            ServerState::RecvCmdInDataReadout | ServerState::RecvCmdInProgramming => {
                self.feed_command(byte, out)
            }
        }
    }

    /// The inactivity timeout expired: back to the initial state.
    pub fn on_inactive(&mut self, out: &mut Vec<Action>) {
        log::info!("inactivity timeout, back to initial state");
        self.reset(out);
    }

    fn reset(&mut self, out: &mut Vec<Action>) {
        self.state = ServerState::RecvRequestMessage;
        self.buf.clear();
        self.last_reply = None;
        out.push(Action::SetBaud(300));
    }

    fn send(&mut self, frame: Vec<u8>, out: &mut Vec<Action>) {
        self.last_reply = Some(frame.clone());
        out.push(Action::Send(frame));
    }

    fn feed_request(&mut self, byte: u8, out: &mut Vec<Action>) {
        self.buf.push(byte);
        if self.buf.len() > REQUEST_BUFFER_LIMIT {
            let excess = self.buf.len() - REQUEST_BUFFER_LIMIT;
            self.buf.drain(..excess);
        }
        if !self.buf.ends_with(b"!\r\n") {
            return;
        }

        // The request may be preceded by noise; take the last slash.
        let Some(slash) = self.buf.iter().rposition(|&b| b == b'/') else {
            return;
        };
        let candidate = &self.buf[slash..self.buf.len() - 3];
        let Some(address) = candidate.strip_prefix(b"/?") else {
            return;
        };
        if address.len() > ADDRESS_LIMIT
            || !address.iter().all(|&b| (0x20..0x7F).contains(&b))
        {
            return;
        }
        let address: String = address.iter().map(|&b| b as char).collect();
        let address = strip_leading_zeros(&address);

        if !self.provider.accept_address(address) {
            log::info!("login for address {:?} is not ours", address);
            self.buf.clear();
            return;
        }

        log::info!("login request for address {:?}", address);
        self.buf.clear();
        self.send(format!("/{}\r\n", self.ident).into_bytes(), out);
        self.state = ServerState::RecvAckOptSelect;
    }

    fn feed_opt_select(&mut self, byte: u8, out: &mut Vec<Action>) {
        self.buf.push(byte);
        if self.buf.len() > REQUEST_BUFFER_LIMIT {
            log::warn!("garbage instead of option select, back to initial state");
            self.reset(out);
            return;
        }
        if !self.buf.ends_with(b"\r\n") {
            return;
        }

        let line: Vec<u8> = self.buf.drain(..).collect();
        let option = match line.as_slice() {
            [control::ACK, v, z, y, control::CR, control::LF] => Some((*v, *z, *y)),
            _ => None,
        };
        let accepted = option.and_then(|(v, z, y)| {
            if v != b'0' {
                return None; // only normal protocol control
            }
            let baud = baud_rate_from_char(z as char)?;
            Some((baud, y))
        });

        match accepted {
            Some((baud, b'0')) => {
                log::info!("option select: data readout at {} baud", baud);
                out.push(Action::SetBaud(baud));
                let readout = self.build_readout();
                self.send(readout, out);
                self.state = ServerState::RecvCmdInDataReadout;
            }
            Some((baud, b'1')) => {
                log::info!("option select: programming mode at {} baud", baud);
                out.push(Action::SetBaud(baud));
                // Empty password prompt: nothing to authenticate.
                let prompt = frame_command(b'P', b'0', Some(""));
                self.send(prompt, out);
                self.state = ServerState::RecvCmdInProgramming;
            }
            _ => {
                log::warn!(
                    "unusable option select {:?}, back to initial state",
                    format_bytes_for_display(&line)
                );
                self.reset(out);
            }
        }
    }

    fn feed_command(&mut self, byte: u8, out: &mut Vec<Action>) {
        if self.buf.is_empty() && byte == control::NAK {
            // Repeat-last-frame request.
            if let Some(reply) = self.last_reply.clone() {
                log::info!("NAK received, repeating last frame");
                out.push(Action::Send(reply));
            }
            return;
        }

        self.buf.push(byte);
        // Drop leading noise until a SOH shows up.
        if let Some(start) = self.buf.iter().position(|&b| b == control::SOH) {
            if start > 0 {
                self.buf.drain(..start);
            }
        } else {
            self.buf.clear();
            return;
        }

        // A complete command holds closer + checksum at the tail.
        let n = self.buf.len();
        if n < 2 || !control::is_closer(self.buf[n - 2]) {
            return;
        }
        let frame: Vec<u8> = self.buf.drain(..).collect();

        if let Err(e) = bcc::check_bcc(&frame) {
            log::warn!("bad command frame ({}), sending NAK", e);
            out.push(Action::Send(vec![control::NAK]));
            return;
        }

        if frame == super::build_break_command() {
            log::info!("break received, back to initial state");
            self.reset(out);
            return;
        }

        if self.state == ServerState::RecvCmdInProgramming {
            self.handle_programming_command(&frame, out);
        } else {
            log::warn!(
                "unexpected command in data readout: {}",
                format_bytes_for_display(&frame)
            );
            out.push(Action::Send(vec![control::NAK]));
        }
    }

    fn handle_programming_command(&mut self, frame: &[u8], out: &mut Vec<Action>) {
        // SOH cmd_id cmd_type [STX dataset] ETX BCC
        let read_address = match frame {
            [control::SOH, b'R', b'1', control::STX, dataset @ .., closer, _bcc]
                if control::is_closer(*closer) =>
            {
                std::str::from_utf8(dataset)
                    .ok()
                    .and_then(|s| s.strip_suffix("()"))
            }
            _ => None,
        };

        let Some(address) = read_address else {
            log::warn!(
                "unsupported programming command: {}",
                format_bytes_for_display(frame)
            );
            out.push(Action::Send(vec![control::NAK]));
            return;
        };

        let body = match self.provider.dataset(address) {
            Some((value, Some(unit))) => format!("({}*{})", value, unit),
            Some((value, None)) => format!("({})", value),
            None => {
                log::warn!("read for unknown register {:?}", address);
                "(ERROR)".to_string()
            }
        };
        log::info!("read {:?} -> {}", address, body);
        let reply = frame_dataset(&body);
        self.send(reply, out);
    }

    fn build_readout(&self) -> Vec<u8> {
        let mut payload = vec![control::STX];
        for address in self.provider.addresses_for_readout() {
            let Some((value, unit)) = self.provider.dataset(&address) else {
                continue;
            };
            let line = match unit {
                Some(unit) => format!("{}({}*{})\r\n", address, value, unit),
                None => format!("{}({})\r\n", address, value),
            };
            payload.extend_from_slice(line.as_bytes());
        }
        payload.extend_from_slice(b"!\r\n");
        payload.push(control::ETX);
        let bcc = bcc::xor_bcc(&payload[1..]);
        payload.push(bcc);
        payload
    }
}

/// Strip leading zeros from a device address; the last digit stays, so
/// `"000"` collapses to `"0"` and not to the broadcast form.
fn strip_leading_zeros(address: &str) -> &str {
    let stripped = address.trim_start_matches('0');
    if stripped.is_empty() && !address.is_empty() {
        &address[address.len() - 1..]
    } else {
        stripped
    }
}

/// Frame `STX body ETX BCC`.
fn frame_dataset(body: &str) -> Vec<u8> {
    let mut frame = vec![control::STX];
    frame.extend_from_slice(body.as_bytes());
    frame.push(control::ETX);
    let bcc = bcc::xor_bcc(&frame[1..]);
    frame.push(bcc);
    frame
}

/// Frame `SOH id type [STX (arg)] ETX BCC`.
fn frame_command(cmd_id: u8, cmd_type: u8, argument: Option<&str>) -> Vec<u8> {
    let mut frame = vec![control::SOH, cmd_id, cmd_type];
    if let Some(arg) = argument {
        frame.push(control::STX);
        frame.push(b'(');
        frame.extend_from_slice(arg.as_bytes());
        frame.push(b')');
    }
    frame.push(control::ETX);
    let bcc = bcc::xor_bcc(&frame[1..]);
    frame.push(bcc);
    frame
}

/// Binds a [`ModeCServer`] to a serial device.
pub struct ServerRunner {
    port: Box<dyn SerialPort>,
    baud: u32,
    inactivity: Duration,
}

impl ServerRunner {
    /// Read timeout per loop iteration; bounds stop-flag latency.
    const READ_TICK: Duration = Duration::from_millis(200);

    /// Open the device at the initial 300 baud, 7E1 with 8N1 fallback for
    /// pseudo-terminal bridges.
    pub fn open(path: &str) -> Result<Self> {
        let builder = serialport::new(path, 300).timeout(Self::READ_TICK);
        let port = match builder
            .clone()
            .data_bits(serialport::DataBits::Seven)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .open()
        {
            Ok(port) => port,
            Err(e) => {
                log::info!("7E1 rejected on {} ({}); using 8N1", path, e);
                builder
                    .data_bits(serialport::DataBits::Eight)
                    .parity(serialport::Parity::None)
                    .stop_bits(serialport::StopBits::One)
                    .open()?
            }
        };
        Ok(Self {
            port,
            baud: 300,
            inactivity: Duration::from_secs(90),
        })
    }

    /// Override the 90 s inactivity timeout.
    pub fn with_inactivity(mut self, inactivity: Duration) -> Self {
        self.inactivity = inactivity;
        self
    }

    /// Serve until the stop flag is raised or the line dies. `on_idle`
    /// runs on every read-timeout tick; returning an error from it stops
    /// the runner (used to surface a dead proxy child).
    pub fn run<P: DataProvider>(
        &mut self,
        server: &mut ModeCServer<P>,
        stop: &AtomicBool,
        mut on_idle: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        let mut byte = [0u8; 1];
        let mut actions = Vec::new();
        let mut last_activity = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            match self.port.read(&mut byte) {
                Ok(0) => return Err(Error::Hangup),
                Ok(_) => {
                    last_activity = Instant::now();
                    server.feed_byte(byte[0], &mut actions);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    on_idle()?;
                    if !server.is_initial() && last_activity.elapsed() >= self.inactivity {
                        server.on_inactive(&mut actions);
                        last_activity = Instant::now();
                    }
                }
                // EIO: the pseudo-terminal peer went away.
                Err(e) if e.raw_os_error() == Some(5) => return Err(Error::Hangup),
                Err(e) => return Err(e.into()),
            }
            self.apply(&mut actions)?;
        }
        Ok(())
    }

    fn apply(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        for action in actions.drain(..) {
            match action {
                Action::SetBaud(baud) => {
                    log::debug!("switching to {} baud", baud);
                    self.port.set_baud_rate(baud)?;
                    self.baud = baud;
                }
                Action::Send(frame) => {
                    log::debug!("send {}", format_bytes_for_display(&frame));
                    self.port.write_all(&frame)?;
                    self.port.flush()?;
                    // Let the line drain; cooperative pseudo-terminal
                    // peers rely on the pacing.
                    let drain = Duration::from_secs_f64(
                        frame.len() as f64 * 10.0 / self.baud as f64,
                    );
                    std::thread::sleep(drain);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iec62056::{build_ack_message, build_break_command, build_read_command, ProtocolMode};

    fn feed(server: &mut ModeCServer<Me162DataProvider>, bytes: &[u8]) -> Vec<Action> {
        let mut out = Vec::new();
        for &b in bytes {
            server.feed_byte(b, &mut out);
        }
        out
    }

    fn sent_frames(actions: &[Action]) -> Vec<&[u8]> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(frame) => Some(frame.as_slice()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_login_yields_identification() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        let actions = feed(&mut server, b"/?!\r\n");
        assert_eq!(sent_frames(&actions), vec![b"/ISK5ME162-0033\r\n" as &[u8]]);
        assert_eq!(server.state(), ServerState::RecvAckOptSelect);
    }

    #[test]
    fn test_login_with_address_and_zero_stripping() {
        struct Picky;
        impl DataProvider for Picky {
            fn addresses_for_readout(&self) -> Vec<String> {
                vec![]
            }
            fn dataset(&self, _address: &str) -> Option<(String, Option<String>)> {
                None
            }
            fn accept_address(&self, address: &str) -> bool {
                address.is_empty() || address == "123"
            }
        }

        let mut server = ModeCServer::new(Picky);
        let mut out = Vec::new();
        for &b in b"/?000123!\r\n" {
            server.feed_byte(b, &mut out);
        }
        assert_eq!(server.state(), ServerState::RecvAckOptSelect);

        let mut server = ModeCServer::new(Picky);
        let mut out = Vec::new();
        for &b in b"/?456!\r\n" {
            server.feed_byte(b, &mut out);
        }
        assert_eq!(server.state(), ServerState::RecvRequestMessage);
        assert!(out.is_empty());
    }

    #[test]
    fn test_request_buffer_is_trimmed() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        let mut out = Vec::new();
        for _ in 0..1000 {
            server.feed_byte(b'x', &mut out);
        }
        assert!(server.buf.len() <= REQUEST_BUFFER_LIMIT);
        // A valid request still goes through after the noise.
        let actions = feed(&mut server, b"/?!\r\n");
        assert_eq!(sent_frames(&actions).len(), 1);
    }

    #[test]
    fn test_data_readout_branch() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        let actions = feed(&mut server, &build_ack_message('5', ProtocolMode::DataReadout));

        assert_eq!(actions[0], Action::SetBaud(9600));
        let frames = sent_frames(&actions);
        assert_eq!(frames.len(), 1);
        let readout = frames[0];
        bcc::check_bcc(readout).unwrap();
        assert_eq!(readout[0], control::STX);
        let text = crate::iec62056::dataset::unpack_datamessage(readout).unwrap();
        let lines = crate::iec62056::dataset::split_readout(&text).unwrap();
        assert_eq!(lines.len(), 9);
        assert!(lines.contains(&"1.8.0(0034204.753*kWh)"));
        assert!(lines.contains(&"F.F(0000000)"));
        assert_eq!(server.state(), ServerState::RecvCmdInDataReadout);
    }

    #[test]
    fn test_programming_branch_read_loop() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        let actions = feed(&mut server, &build_ack_message('5', ProtocolMode::Programming));
        assert_eq!(actions[0], Action::SetBaud(9600));
        // Empty password prompt: SOH P 0 STX () ETX BCC.
        assert_eq!(
            sent_frames(&actions),
            vec![&[0x01, b'P', b'0', 0x02, b'(', b')', 0x03, 0x60] as &[u8]]
        );
        assert_eq!(server.state(), ServerState::RecvCmdInProgramming);

        let actions = feed(&mut server, &build_read_command("1.8.0"));
        let frames = sent_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            crate::iec62056::dataset::unpack_datamessage(frames[0]).unwrap(),
            "(0034204.753*kWh)"
        );

        let actions = feed(&mut server, &build_read_command("9.9.9"));
        assert_eq!(
            crate::iec62056::dataset::unpack_datamessage(sent_frames(&actions)[0]).unwrap(),
            "(ERROR)"
        );
    }

    #[test]
    fn test_bad_bcc_gets_nak_and_nak_repeats() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        feed(&mut server, &build_ack_message('5', ProtocolMode::Programming));

        let mut cmd = build_read_command("1.8.0");
        *cmd.last_mut().unwrap() ^= 0x01;
        let actions = feed(&mut server, &cmd);
        assert_eq!(sent_frames(&actions), vec![&[control::NAK] as &[u8]]);
        assert_eq!(server.state(), ServerState::RecvCmdInProgramming);

        // A proper read, then a NAK asking for the same frame again.
        let actions = feed(&mut server, &build_read_command("2.8.0"));
        let first = sent_frames(&actions)[0].to_vec();
        let actions = feed(&mut server, &[control::NAK]);
        assert_eq!(sent_frames(&actions), vec![first.as_slice()]);
    }

    #[test]
    fn test_nak_repeats_readout() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        let actions = feed(&mut server, &build_ack_message('5', ProtocolMode::DataReadout));
        let readout = sent_frames(&actions)[0].to_vec();

        let actions = feed(&mut server, &[control::NAK]);
        assert_eq!(sent_frames(&actions), vec![readout.as_slice()]);
    }

    #[test]
    fn test_break_returns_to_initial() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        feed(&mut server, &build_ack_message('5', ProtocolMode::Programming));

        let actions = feed(&mut server, &build_break_command());
        assert!(actions.contains(&Action::SetBaud(300)));
        assert!(server.is_initial());
    }

    #[test]
    fn test_noise_before_soh_is_dropped() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        feed(&mut server, &build_ack_message('5', ProtocolMode::Programming));

        let mut noisy = b"zzz".to_vec();
        noisy.extend_from_slice(&build_read_command("1.8.0"));
        let actions = feed(&mut server, &noisy);
        assert_eq!(sent_frames(&actions).len(), 1);
    }

    #[test]
    fn test_bad_option_select_resets() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        let actions = feed(&mut server, b"\x06059\r\n"); // mode 9 does not exist
        assert!(actions.contains(&Action::SetBaud(300)));
        assert!(server.is_initial());
    }

    #[test]
    fn test_unsupported_programming_command_gets_nak() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        feed(&mut server, &build_ack_message('5', ProtocolMode::Programming));

        let write = bcc::append_bcc(b"\x01W1\x021.8.0(1)\x03").unwrap();
        let actions = feed(&mut server, &write);
        assert_eq!(sent_frames(&actions), vec![&[control::NAK] as &[u8]]);
    }

    #[test]
    fn test_inactivity_reset() {
        let mut server = ModeCServer::new(Me162DataProvider::sample());
        feed(&mut server, b"/?!\r\n");
        assert!(!server.is_initial());
        let mut out = Vec::new();
        server.on_inactive(&mut out);
        assert!(server.is_initial());
        assert_eq!(out, vec![Action::SetBaud(300)]);
    }
}
