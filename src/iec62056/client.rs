//! IEC 62056-21 mode C client.
//!
//! Drives a meter through the sign-on handshake at 300 baud, follows the
//! negotiated baud changeover, and then either decodes the full data
//! readout or polls individual registers in programming mode. Parsed
//! registers are handed to a [`ValueProcessor`], which owns the publish
//! policy.
//!
//! The session is strictly half-duplex: every state either transmits one
//! message or collects one reply byte-for-byte, with the state owning the
//! predicate that decides when the reply is complete.

use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::iec62056::dataset::{parse_dataset, split_readout, unpack_datamessage};
use crate::iec62056::{
    baud_rate_from_char, build_ack_message, build_break_command, build_read_command,
    build_request_message, control, format_bytes_for_display, ProtocolMode,
};
use crate::processor::ValueProcessor;
use crate::serial::SerialLine;
use crate::{Error, Result};

/// The identification must start arriving well within the 1500 ms
/// reaction window; five seconds is generous.
pub const IDENT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Window for a complete datamessage. The readout is the largest message
/// and still fits in a fraction of this at 9600 baud.
pub const DATAMESSAGE_RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between programming-mode poll rounds.
pub const POLL_PAUSE: Duration = Duration::from_secs(2);

/// Expected programming-mode acknowledgement: an empty password prompt,
/// `SOH P 0 STX () ETX BCC`.
const PROG_MODE_ACK: &[u8] = &[0x01, b'P', b'0', 0x02, b'(', b')', 0x03, 0x60];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    DataReadout,
    ProgrammingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Io {
    WBreak,
    WLogin,
    RIdent,
    WReqDataMode,
    RDataReadout,
    WReqProgMode,
    RAckProgMode,
    WReqObis,
    RReadObis,
    TryPublish,
    Sleep,
    End,
}

impl Io {
    fn is_read(&self) -> bool {
        matches!(
            self,
            Io::RIdent | Io::RDataReadout | Io::RAckProgMode | Io::RReadObis
        )
    }
}

/// Explicit session state: which sub-protocol we are after, where in the
/// exchange we are, and which register to poll next.
pub struct Session {
    mode: Mode,
    io: Io,
    /// Baud changeover character from the identification, echoed verbatim
    /// in the option select.
    baud_char: char,
    obis_idx: usize,
    obis_requests: Vec<String>,
}

impl Session {
    pub fn new(obis_requests: Vec<String>) -> Self {
        Self {
            mode: Mode::DataReadout,
            io: Io::WBreak,
            baud_char: '5',
            obis_idx: 0,
            obis_requests,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn io(&self) -> Io {
        self.io
    }

    fn obis_request(&self) -> &str {
        &self.obis_requests[self.obis_idx]
    }

    fn obis_has_next(&self) -> bool {
        self.obis_idx + 1 < self.obis_requests.len()
    }

    fn obis_set_next(&mut self) {
        self.obis_idx += 1;
    }

    fn obis_reset(&mut self) {
        self.obis_idx = 0;
    }
}

impl Default for Session {
    /// Polls the two totals that feed the power estimate.
    fn default() -> Self {
        Self::new(vec!["1.8.0".to_string(), "2.8.0".to_string()])
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}", self.mode, self.io)
    }
}

/// A meter identification line, `/XXXZident`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub manufacturer: String,
    pub baud_char: char,
    pub model: String,
}

/// Parse the identification response, without the CR LF tail.
pub fn parse_identification(line: &str) -> Result<Identification> {
    let malformed = || Error::MalformedFrame(format!("bad identification {:?}", line));

    let rest = line.strip_prefix('/').ok_or_else(malformed)?;
    let mut chars = rest.chars();
    let manufacturer: String = chars.by_ref().take(3).collect();
    if manufacturer.len() != 3 || !manufacturer.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(malformed());
    }
    let baud_char = chars.next().ok_or_else(malformed)?;
    let model: String = chars.collect();
    if model.is_empty() {
        return Err(malformed());
    }

    Ok(Identification {
        manufacturer,
        baud_char,
        model,
    })
}

pub struct ModeCClient<P: ValueProcessor> {
    line: SerialLine,
    processor: P,
}

impl<P: ValueProcessor> ModeCClient<P> {
    /// Open the serial device. Starts at 9600 baud because the peer might
    /// still be in the upgraded state from a previous session; the break
    /// in the first protocol state brings both sides back to 300.
    pub async fn open(devname: &str, processor: P) -> Result<Self> {
        let line = SerialLine::open(devname, 9600).await?;
        Ok(Self { line, processor })
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut P {
        &mut self.processor
    }

    /// Run a polling session with the default register list until the
    /// processor asks to stop or the transport dies.
    pub async fn run(&mut self) -> Result<()> {
        let mut session = Session::default();
        self.run_session(&mut session).await
    }

    pub async fn run_session(&mut self, session: &mut Session) -> Result<()> {
        while self.step(session).await? {}
        log::debug!("{}: session finished", session);
        Ok(())
    }

    /// One receive/act cycle. Returns false when the session is over.
    async fn step(&mut self, session: &mut Session) -> Result<bool> {
        // Receive phase. Timeouts do not kill the session: they fall back
        // to an earlier state, and the dead man's switch is the backstop.
        let mut buf: Vec<u8> = Vec::new();
        if session.io.is_read() {
            if session.io == Io::RIdent {
                match timeout(IDENT_RECV_TIMEOUT, self.recv_text(&mut buf)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        log::error!("{}: timeout waiting for identification", session);
                        session.io = Io::WLogin;
                    }
                }
            } else {
                match timeout(DATAMESSAGE_RECV_TIMEOUT, self.recv_datamessage(&mut buf)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        log::error!(
                            "{}: timeout waiting for datamessage: {}",
                            session,
                            format_bytes_for_display(&buf)
                        );
                        session.io = Io::WReqObis;
                    }
                }
                if session.io.is_read() && buf.is_empty() {
                    // A bare NAK: the peer wants our last message again.
                    log::error!("{}: got NAK", session);
                    session.io = match session.io {
                        Io::RDataReadout => Io::WReqDataMode,
                        _ => Io::WReqObis,
                    };
                }
            }
        }

        // Act phase.
        match session.io {
            Io::WBreak => {
                self.send(&build_break_command(), session).await?;
                self.line.set_baud(300)?;
                session.io = Io::WLogin;
            }

            Io::WLogin => {
                self.send(&build_request_message(None), session).await?;
                session.io = Io::RIdent;
            }

            Io::RIdent => {
                let text: String = buf.iter().map(|&b| b as char).collect();
                match parse_identification(text.trim_end()) {
                    Ok(ident) if baud_rate_from_char(ident.baud_char).is_some() => {
                        log::info!(
                            "{}: meter {}, model {}, changeover '{}'",
                            session,
                            ident.manufacturer,
                            ident.model,
                            ident.baud_char
                        );
                        session.baud_char = ident.baud_char;
                        session.io = match session.mode {
                            Mode::DataReadout => Io::WReqDataMode,
                            Mode::ProgrammingMode => Io::WReqProgMode,
                        };
                    }
                    Ok(ident) => {
                        log::error!(
                            "{}: unsupported baud changeover '{}', restarting",
                            session,
                            ident.baud_char
                        );
                        session.io = Io::WBreak;
                    }
                    Err(e) => {
                        log::error!("{}: {}", session, e);
                        session.io = Io::WLogin;
                    }
                }
            }

            Io::WReqDataMode => {
                let ack = build_ack_message(session.baud_char, ProtocolMode::DataReadout);
                self.send(&ack, session).await?;
                self.switch_baud(session)?;
                session.io = Io::RDataReadout;
            }

            Io::RDataReadout => match unpack_datamessage(&buf) {
                Ok(text) => {
                    self.processor.set_readout(&text);
                    match self.apply_readout(&text) {
                        Ok(()) => {
                            // Continue into programming mode for the
                            // per-register poll loop.
                            session.mode = Mode::ProgrammingMode;
                            session.io = Io::WBreak;
                        }
                        Err(e) => {
                            log::error!("{}: unusable readout: {}", session, e);
                            session.io = Io::WReqObis;
                        }
                    }
                }
                Err(e) => {
                    log::error!("{}: bad readout frame ({}), sending NAK", session, e);
                    self.send(&[control::NAK], session).await?;
                }
            },

            Io::WReqProgMode => {
                let ack = build_ack_message(session.baud_char, ProtocolMode::Programming);
                self.send(&ack, session).await?;
                self.switch_baud(session)?;
                session.io = Io::RAckProgMode;
            }

            Io::RAckProgMode => {
                if let Err(e) = crate::iec62056::bcc::check_bcc(&buf) {
                    log::error!("{}: bad acknowledgement ({}), sending NAK", session, e);
                    self.send(&[control::NAK], session).await?;
                } else if buf != PROG_MODE_ACK {
                    let desync = Error::ProtocolDesync {
                        state: "R_ACK_PROG_MODE",
                        detail: format_bytes_for_display(&buf),
                    };
                    log::error!("{}: {}", session, desync);
                    session.io = Io::WReqObis;
                } else {
                    session.io = Io::WReqObis;
                }
            }

            Io::WReqObis => {
                let cmd = build_read_command(session.obis_request());
                self.send(&cmd, session).await?;
                session.io = Io::RReadObis;
            }

            Io::RReadObis => match unpack_datamessage(&buf) {
                Ok(text) => {
                    match self.apply_register_reply(session.obis_request(), &text) {
                        Ok(()) => {
                            if session.obis_has_next() {
                                session.obis_set_next();
                                session.io = Io::WReqObis;
                            } else {
                                session.io = Io::TryPublish;
                            }
                        }
                        Err(e) => {
                            log::error!("{}: {}", session, e);
                            session.io = Io::WReqObis;
                        }
                    }
                }
                Err(e) => {
                    log::error!("{}: bad register frame ({}), sending NAK", session, e);
                    self.send(&[control::NAK], session).await?;
                }
            },

            Io::TryPublish => {
                self.processor.try_publish();
                session.io = if self.processor.should_stop() {
                    Io::End
                } else {
                    Io::Sleep
                };
            }

            Io::Sleep => {
                sleep(POLL_PAUSE).await;
                session.obis_reset();
                session.io = Io::WReqObis;
            }

            Io::End => return Ok(false),
        }

        Ok(true)
    }

    /// Feed every dataset of a decoded readout to the processor.
    fn apply_readout(&mut self, text: &str) -> Result<()> {
        for line in split_readout(text)? {
            let dataset = parse_dataset(line)?;
            self.processor
                .set_register(&dataset.address, &dataset.value, dataset.unit.as_deref())?;
        }
        Ok(())
    }

    /// A programming-mode reply carries the value for the register we just
    /// asked for, with an empty address slot.
    fn apply_register_reply(&mut self, address: &str, text: &str) -> Result<()> {
        let dataset = parse_dataset(text)?;
        if !dataset.address.is_empty() {
            return Err(Error::ProtocolDesync {
                state: "R_READ_OBIS",
                detail: format!("unexpected address in reply {:?}", text),
            });
        }
        self.processor
            .set_register(address, &dataset.value, dataset.unit.as_deref())
    }

    fn switch_baud(&mut self, session: &Session) -> Result<()> {
        // The changeover character was validated when the identification
        // came in; fall back to the sign-on rate rather than panic.
        let baud = baud_rate_from_char(session.baud_char).unwrap_or(300);
        self.line.set_baud(baud)
    }

    async fn send(&mut self, msg: &[u8], session: &Session) -> Result<()> {
        log::debug!("{}: send {}", session, format_bytes_for_display(msg));
        self.line.send(msg).await
    }

    /// Collect a CR LF terminated text line.
    async fn recv_text(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        while !buf.ends_with(b"\r\n") {
            buf.push(self.line.read_byte().await?);
        }
        log::debug!("recv {}", format_bytes_for_display(buf));
        Ok(())
    }

    /// Collect a datamessage: everything up to ETX/EOT plus the checksum
    /// byte. A leading NAK leaves the buffer empty.
    async fn recv_datamessage(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        let first = self.line.read_byte().await?;
        if first == control::NAK {
            return Ok(());
        }
        buf.push(first);
        while buf.len() < 2 || !control::is_closer(buf[buf.len() - 2]) {
            buf.push(self.line.read_byte().await?);
        }
        log::debug!("recv {}", format_bytes_for_display(buf));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iec62056::bcc;

    #[test]
    fn test_parse_identification() {
        let ident = parse_identification("/ISK5ME162-0033").unwrap();
        assert_eq!(ident.manufacturer, "ISK");
        assert_eq!(ident.baud_char, '5');
        assert_eq!(ident.model, "ME162-0033");
    }

    #[test]
    fn test_parse_identification_rejects_garbage() {
        assert!(parse_identification("ISK5ME162-0033").is_err());
        assert!(parse_identification("/IS").is_err());
        assert!(parse_identification("/1235X").is_err());
        assert!(parse_identification("/ISK5").is_err());
    }

    #[test]
    fn test_prog_mode_ack_literal() {
        assert_eq!(bcc::append_bcc(b"\x01P0\x02()\x03").unwrap(), PROG_MODE_ACK);
    }

    #[test]
    fn test_session_obis_rotation() {
        let mut session = Session::default();
        assert_eq!(session.obis_request(), "1.8.0");
        assert!(session.obis_has_next());
        session.obis_set_next();
        assert_eq!(session.obis_request(), "2.8.0");
        assert!(!session.obis_has_next());
        session.obis_reset();
        assert_eq!(session.obis_request(), "1.8.0");
    }

    #[test]
    fn test_session_display() {
        let session = Session::default();
        assert_eq!(session.to_string(), "DataReadout:WBreak");
    }

    #[test]
    fn test_timing_windows() {
        use crate::serial::line::PRE_SEND_DELAY;
        // Reaction floor: at least 20 ms, below the 1500 ms ceiling.
        assert!(PRE_SEND_DELAY >= Duration::from_millis(20));
        assert!(PRE_SEND_DELAY <= Duration::from_millis(1500));
        assert!(IDENT_RECV_TIMEOUT <= Duration::from_secs(60));
        assert!(DATAMESSAGE_RECV_TIMEOUT <= Duration::from_secs(60));
    }
}
