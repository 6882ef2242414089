//! Pseudo-terminal serial proxy.
//!
//! Behaves like `socat PTY,link=a.sock PTY,link=b.sock`, with two
//! additions: bytes are forwarded no faster than the sender's baud rate
//! permits, and the baud rates configured on the two endpoints are
//! compared so a changeover gone wrong shows up in the logs.
//!
//! The proxy owns both controller descriptors. Peers attach by opening
//! the worker paths; the B side can be advertised as a filesystem symlink
//! which disappears as soon as traffic starts flowing. Attachment and
//! detachment are observed through POLLHUP on the controllers: a
//! controller whose worker side has been opened and closed once reports
//! HUP exactly while no peer holds it open.
//!
//! Instances are single-use. After a peer disconnects, the terminal
//! attributes are left in a state that makes a clean reattach impossible,
//! so a fresh proxy (with fresh pseudo-terminals) is required per session.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::termios::{cfgetospeed, tcgetattr, BaudRate};
use nix::unistd::ttyname;

use crate::serial::line::BITS_PER_BYTE;
use crate::{Error, Result};

/// How often the forwarding loop wakes up when nothing is due, which also
/// bounds the latency of stop-flag and HUP detection.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One pseudo-terminal endpoint: the controller side we keep, the worker
/// path a peer opens, and the queue of bytes awaiting baud-paced emission.
struct ProxyPty {
    controller: File,
    worker_path: PathBuf,
    /// Bytes to write out, each tagged with the baud rate of the side it
    /// was read from.
    queue: VecDeque<(u8, u32)>,
    last_emit: Option<Instant>,
    baud: u32,
}

impl ProxyPty {
    fn new() -> Result<Self> {
        let pty = openpty(None, None)?;
        // Resolve the worker path while the descriptor is still open, then
        // close it so the controller reports HUP until a peer attaches.
        let worker_path = ttyname(pty.slave.as_fd())?;
        drop(pty.slave);

        Ok(Self {
            controller: File::from(pty.master),
            worker_path,
            queue: VecDeque::new(),
            last_emit: None,
            baud: 0,
        })
    }

    /// Baud rate currently configured on this endpoint's terminal.
    fn sample_baud(&mut self) -> u32 {
        if let Ok(termios) = tcgetattr(&self.controller) {
            if let Some(baud) = baud_to_u32(cfgetospeed(&termios)) {
                self.baud = baud;
            }
        }
        self.baud
    }

    fn enqueue(&mut self, byte: u8, source_baud: u32) {
        self.queue.push_back((byte, source_baud));
    }

    /// When the byte at the head of the queue may be written.
    fn next_due(&self) -> Option<Instant> {
        let &(_, source_baud) = self.queue.front()?;
        Some(match self.last_emit {
            Some(last) => last + byte_spacing(source_baud),
            None => Instant::now(),
        })
    }

    /// Write out every byte whose baud delay has elapsed. Returns false
    /// when the peer side turns out to be gone.
    fn emit_due(&mut self) -> Result<bool> {
        while let Some(&(byte, source_baud)) = self.queue.front() {
            match self.next_due() {
                Some(due) if due <= Instant::now() => {}
                _ => break,
            }
            self.queue.pop_front();

            let dest_baud = self.sample_baud();
            if dest_baud != source_baud {
                // Not necessarily a problem; there is a short window
                // around every changeover. Many of these are.
                log::warn!(
                    "baudrate mismatch, forwarding 0x{:02x} from {} to {}",
                    byte,
                    source_baud,
                    dest_baud
                );
            }

            match (&self.controller).write_all(&[byte]) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            self.last_emit = Some(Instant::now());
        }
        Ok(true)
    }

    /// Read one byte off the controller. `Ok(None)` means hangup.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match (&self.controller).read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Two pseudo-terminals glued back to back.
pub struct SerialProxy {
    a: ProxyPty,
    b: ProxyPty,
    exposed: Option<PathBuf>,
}

impl SerialProxy {
    pub fn new() -> Result<Self> {
        Ok(Self {
            a: ProxyPty::new()?,
            b: ProxyPty::new()?,
            exposed: None,
        })
    }

    /// Create a proxy whose B side is advertised as a symlink, the way a
    /// well-known device path would be. The symlink is removed once the
    /// first byte flows, or at the latest when the proxy shuts down.
    pub fn exposed(link: &Path) -> Result<Self> {
        let mut proxy = Self::new()?;
        std::os::unix::fs::symlink(&proxy.b.worker_path, link)?;
        proxy.exposed = Some(link.to_path_buf());
        Ok(proxy)
    }

    /// Device path of the A (server) side.
    pub fn a_dev(&self) -> &Path {
        &self.a.worker_path
    }

    /// Device path of the B (client) side.
    pub fn b_dev(&self) -> &Path {
        &self.b.worker_path
    }

    /// Wait for both peers, forward until one of them disconnects or the
    /// stop flag is raised, then clean up. Blocking; run on a dedicated
    /// thread or in a dedicated process.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        let result = self.wait_for_peers(stop).and_then(|attached| {
            if attached {
                log::info!("Both sides connected, forwarding");
                self.forward(stop)
            } else {
                Ok(())
            }
        });
        self.hide();
        result
    }

    /// Poll the controllers until neither reports HUP, meaning both worker
    /// sides are held open by a peer. Returns false when stopped early.
    fn wait_for_peers(&mut self, stop: &AtomicBool) -> Result<bool> {
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let (ra, rb) = self.poll_both(0)?;
            if !(ra | rb).intersects(PollFlags::POLLHUP) {
                return Ok(true);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn forward(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            let mut timeout = POLL_INTERVAL;
            for due in [self.a.next_due(), self.b.next_due()] {
                if let Some(due) = due {
                    timeout = timeout.min(due.saturating_duration_since(now));
                }
            }

            let (ra, rb) = self.poll_both(timeout.as_millis() as u16)?;

            let mut alive = true;
            if ra.contains(PollFlags::POLLIN) {
                alive &= relay(&mut self.a, &mut self.b)?;
            }
            if rb.contains(PollFlags::POLLIN) {
                alive &= relay(&mut self.b, &mut self.a)?;
            }
            if (ra | rb).intersects(PollFlags::POLLIN) {
                // Someone is talking; the advertised path has served its
                // purpose.
                self.hide();
            }

            alive &= self.a.emit_due()?;
            alive &= self.b.emit_due()?;

            if !alive || (ra | rb).intersects(PollFlags::POLLHUP) {
                log::info!("One side closed the connection, stopping");
                return Ok(());
            }
        }
        Ok(())
    }

    fn poll_both(&self, timeout_ms: u16) -> Result<(PollFlags, PollFlags)> {
        let mut fds = [
            PollFd::new(self.a.controller.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.b.controller.as_fd(), PollFlags::POLLIN),
        ];
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::ZERO);
        poll(&mut fds, timeout)?;

        let ra = fds[0].revents().unwrap_or(PollFlags::empty());
        let rb = fds[1].revents().unwrap_or(PollFlags::empty());
        for revents in [ra, rb] {
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                return Err(Error::Io(std::io::Error::other(format!(
                    "poll error on pseudo-terminal: {:?}",
                    revents
                ))));
            }
        }
        Ok((ra, rb))
    }

    fn hide(&mut self) {
        if let Some(link) = self.exposed.take() {
            if let Err(e) = std::fs::remove_file(&link) {
                log::warn!("could not remove {}: {}", link.display(), e);
            }
        }
    }
}

impl Drop for SerialProxy {
    fn drop(&mut self) {
        self.hide();
    }
}

/// Move one byte from one endpoint to the other's queue, tagged with the
/// source side's baud rate. Returns false on hangup.
fn relay(from: &mut ProxyPty, to: &mut ProxyPty) -> Result<bool> {
    match from.read_byte()? {
        Some(byte) => {
            let source_baud = from.sample_baud();
            to.enqueue(byte, source_baud);
            Ok(true)
        }
        None => Ok(false),
    }
}

fn byte_spacing(baud: u32) -> Duration {
    Duration::from_secs_f64(BITS_PER_BYTE as f64 / baud.max(1) as f64)
}

fn baud_to_u32(speed: BaudRate) -> Option<u32> {
    match speed {
        BaudRate::B50 => Some(50),
        BaudRate::B75 => Some(75),
        BaudRate::B110 => Some(110),
        BaudRate::B134 => Some(134),
        BaudRate::B150 => Some(150),
        BaudRate::B200 => Some(200),
        BaudRate::B300 => Some(300),
        BaudRate::B600 => Some(600),
        BaudRate::B1200 => Some(1200),
        BaudRate::B1800 => Some(1800),
        BaudRate::B2400 => Some(2400),
        BaudRate::B4800 => Some(4800),
        BaudRate::B9600 => Some(9600),
        BaudRate::B19200 => Some(19200),
        BaudRate::B38400 => Some(38400),
        BaudRate::B57600 => Some(57600),
        BaudRate::B115200 => Some(115200),
        BaudRate::B230400 => Some(230400),
        _ => None,
    }
}
