// SPDX-License-Identifier: GPL-2.0-or-later

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::info;

use crate::error::{Error, Result};
use crate::logging::SessionLog;
use crate::util::terminal_size;

/// Default budget for `read_until` when the script does not bound it.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3600);

const POLL_SLICE_MS: i32 = 200;

/// What `read_until` waits for.
#[derive(Clone)]
pub enum Pattern {
    Literal(Vec<u8>),
    Regex(Rc<regex::bytes::Regex>),
}

impl Pattern {
    /// Byte offset one past the end of the first match, if any.
    fn match_end(&self, haystack: &[u8]) -> Option<usize> {
        match self {
            Pattern::Literal(needle) => {
                if needle.is_empty() {
                    return Some(0);
                }
                haystack
                    .windows(needle.len())
                    .position(|w| w == needle.as_slice())
                    .map(|start| start + needle.len())
            }
            Pattern::Regex(re) => re.find(haystack).map(|m| m.end()),
        }
    }
}

/// Byte-stream driver for the guest serial console. Everything read is
/// echoed to the controlling terminal and appended to the session log, the
/// way a user watching the boot would see it.
pub struct ConsoleIo {
    stream: UnixStream,
    buffer: Vec<u8>,
    log: SessionLog,
    pump: Option<Receiver<Vec<u8>>>,
    interrupt: Arc<AtomicBool>,
    winch: Arc<AtomicBool>,
}

impl ConsoleIo {
    pub fn new(
        stream: UnixStream,
        log: SessionLog,
        interrupt: Arc<AtomicBool>,
        winch: Arc<AtomicBool>,
    ) -> io::Result<ConsoleIo> {
        stream.set_nonblocking(true)?;
        Ok(ConsoleIo {
            stream,
            buffer: Vec::new(),
            log,
            pump: None,
            interrupt,
            winch,
        })
    }

    /// Attach the batch-mode input pump; received keystrokes are flushed to
    /// the guest at every poll slice.
    pub fn set_pump(&mut self, rx: Receiver<Vec<u8>>) {
        self.pump = Some(rx);
    }

    pub fn clear_pump(&mut self) {
        self.pump = None;
    }

    fn checkpoints(&self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(Error::Interrupted);
        }
        if self.winch.swap(false, Ordering::Relaxed) {
            let (rows, cols) = terminal_size();
            info!("try set terminal window size to {cols}x{rows}");
            // TODO: use qmp to propagate console window size to the guest
        }
        Ok(())
    }

    fn drain_pump(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        if let Some(rx) = &self.pump {
            while let Ok(chunk) = rx.try_recv() {
                pending.push(chunk);
            }
        }
        for chunk in pending {
            self.write(&chunk)?;
        }
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            match (&self.stream).write(&data[offset..]) {
                Ok(n) => offset += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = self.stream.as_fd();
                    let mut fds = [PollFd::new(&fd, PollFlags::POLLOUT)];
                    match poll(&mut fds, POLL_SLICE_MS) {
                        Ok(_) | Err(Errno::EINTR) => {}
                        Err(errno) => return Err(Error::Io(errno.into())),
                    }
                    self.checkpoints()?;
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
        Ok(())
    }

    pub fn writeline(&mut self, data: &[u8]) -> Result<()> {
        self.write(data)?;
        self.write(b"\n")
    }

    /// One bounded poll-and-read step. Returns the number of bytes consumed
    /// from the guest, 0 on idle, or an error on console EOF.
    fn pump_once(&mut self) -> Result<usize> {
        self.checkpoints()?;
        self.drain_pump()?;

        {
            let fd = self.stream.as_fd();
            let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
            match poll(&mut fds, POLL_SLICE_MS) {
                Ok(0) => return Ok(0),
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(0),
                Err(errno) => return Err(Error::Io(errno.into())),
            }
        }

        let mut chunk = [0u8; 4096];
        match (&self.stream).read(&mut chunk) {
            Ok(0) => Err(Error::Other("console closed by the vm".to_string())),
            Ok(n) => {
                let data = &chunk[..n];
                self.buffer.extend_from_slice(data);
                let mut stdout = io::stdout();
                let _ = stdout.write_all(data);
                let _ = stdout.flush();
                self.log.write_raw(data);
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Read until `pattern` matches, consuming and returning everything up
    /// to and including the match. Bounded by `timeout`.
    pub fn read_until(&mut self, pattern: &Pattern, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(end) = pattern.match_end(&self.buffer) {
                let consumed: Vec<u8> = self.buffer.drain(..end).collect();
                return Ok(consumed);
            }

            if Instant::now() >= deadline {
                return Err(Error::Other(format!(
                    "read_until: no match within {}s",
                    timeout.as_secs()
                )));
            }

            self.pump_once()?;
        }
    }

    /// Read whatever arrives for `timeout`, consuming and returning it.
    /// Console EOF ends the wait early with what was collected.
    pub fn read_until_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            match self.pump_once() {
                Ok(_) => {}
                Err(Error::Other(_)) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(self.buffer.drain(..).collect())
    }

    /// Full-duplex pass-through between the controlling terminal and the
    /// console, until either side reaches EOF.
    pub fn interactive(&mut self, raw_mode: bool) -> Result<()> {
        let _raw = if raw_mode {
            Some(RawModeGuard::set(0)?)
        } else {
            None
        };

        // anything buffered from batch mode is shown first
        if !self.buffer.is_empty() {
            let pending: Vec<u8> = self.buffer.drain(..).collect();
            let mut stdout = io::stdout();
            let _ = stdout.write_all(&pending);
            let _ = stdout.flush();
        }

        loop {
            match self.checkpoints() {
                Ok(()) => {}
                Err(Error::Interrupted) if raw_mode => {}
                Err(err) => return Err(err),
            }

            let stdin = io::stdin();
            let revents = {
                let stdin_fd = stdin.as_fd();
                let stream_fd = self.stream.as_fd();
                let mut fds = [
                    PollFd::new(&stdin_fd, PollFlags::POLLIN),
                    PollFd::new(&stream_fd, PollFlags::POLLIN),
                ];
                match poll(&mut fds, POLL_SLICE_MS) {
                    Ok(0) | Err(Errno::EINTR) => continue,
                    Ok(_) => [
                        fds[0].revents().unwrap_or(PollFlags::empty()),
                        fds[1].revents().unwrap_or(PollFlags::empty()),
                    ],
                    Err(errno) => return Err(Error::Io(errno.into())),
                }
            };

            if revents[0].intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                let mut buf = [0u8; 1024];
                match nix::unistd::read(0, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.write(&buf[..n])?,
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                    Err(errno) => return Err(Error::Io(errno.into())),
                }
            }

            if revents[1].intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                let mut chunk = [0u8; 4096];
                match (&self.stream).read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = &chunk[..n];
                        let mut stdout = io::stdout();
                        let _ = stdout.write_all(data);
                        let _ = stdout.flush();
                        self.log.write_raw(data);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(Error::Io(err)),
                }
            }
        }

        Ok(())
    }
}

/// Puts a terminal fd into raw mode, restoring the saved attributes on drop.
pub struct RawModeGuard {
    fd: i32,
    saved: nix::sys::termios::Termios,
}

impl RawModeGuard {
    pub fn set(fd: i32) -> Result<RawModeGuard> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};

        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let saved = tcgetattr(borrowed).map_err(|e| Error::Io(e.into()))?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(borrowed, SetArg::TCSAFLUSH, &raw).map_err(|e| Error::Io(e.into()))?;

        Ok(RawModeGuard { fd, saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd) };
        let _ = tcsetattr(borrowed, SetArg::TCSAFLUSH, &self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> (Arc<AtomicBool>, Arc<AtomicBool>) {
        (
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn read_until_literal_consumes_through_match() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (interrupt, winch) = flags();
        let mut io = ConsoleIo::new(ours, SessionLog::global().clone(), interrupt, winch).unwrap();

        (&theirs).write_all(b"login: rest").unwrap();

        let got = io
            .read_until(
                &Pattern::Literal(b"login:".to_vec()),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(got, b"login:");

        // remainder stays buffered for the next read
        let rest = io
            .read_until(&Pattern::Literal(b"rest".to_vec()), Duration::from_secs(2))
            .unwrap();
        assert_eq!(rest, b" rest");
    }

    #[test]
    fn read_until_regex() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (interrupt, winch) = flags();
        let mut io = ConsoleIo::new(ours, SessionLog::global().clone(), interrupt, winch).unwrap();

        (&theirs).write_all(b"boot took 42ms\n").unwrap();

        let re = regex::bytes::Regex::new(r"took \d+ms").unwrap();
        let got = io
            .read_until(&Pattern::Regex(Rc::new(re)), Duration::from_secs(2))
            .unwrap();
        assert_eq!(got, b"boot took 42ms");
    }

    #[test]
    fn read_until_times_out() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let (interrupt, winch) = flags();
        let mut io = ConsoleIo::new(ours, SessionLog::global().clone(), interrupt, winch).unwrap();

        let err = io
            .read_until(
                &Pattern::Literal(b"never".to_vec()),
                Duration::from_millis(250),
            )
            .unwrap_err();
        assert!(err.to_string().contains("read_until"));
    }

    #[test]
    fn interrupt_flag_aborts_read() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let (interrupt, winch) = flags();
        interrupt.store(true, Ordering::Relaxed);
        let mut io = ConsoleIo::new(ours, SessionLog::global().clone(), interrupt, winch).unwrap();

        assert!(matches!(
            io.read_until(&Pattern::Literal(b"x".to_vec()), Duration::from_secs(5)),
            Err(Error::Interrupted)
        ));
    }

    #[test]
    fn pumped_keystrokes_reach_the_guest() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let (interrupt, winch) = flags();
        let mut io = ConsoleIo::new(ours, SessionLog::global().clone(), interrupt, winch).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        io.set_pump(rx);
        tx.send(b"keys".to_vec()).unwrap();

        let _ = io.read_until_timeout(Duration::from_millis(250)).unwrap();

        let mut theirs_nb = theirs;
        theirs_nb.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];
        let n = theirs_nb.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"keys");
    }
}
