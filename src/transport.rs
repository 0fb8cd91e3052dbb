//! The line-oriented channel a session talks through.
//!
//! A [`Transport`] is synchronous and owned by exactly one session. Implementations exist for any
//! byte stream via [`LineTransport`]; VISA/GPIB bindings can implement the trait directly and
//! answer [`Transport::read_status_byte`] with a hardware serial poll.

use core::ops::{Deref, DerefMut};

use embedded_io::{Error as _, ErrorKind};
use thiserror::Error;

use crate::clock::{Clock, Millis};

/// Line-level duplex channel to one instrument (or one link controller).
pub trait Transport {
    type Error: embedded_io::Error;

    /// Send one line. The terminator is added by the transport.
    fn write_line(&mut self, line: &str) -> Result<(), Self::Error>;

    /// Receive one line, terminator stripped. Fails with a `TimedOut` error if nothing arrives
    /// within [`Transport::timeout`].
    fn read_line(&mut self) -> Result<String, Self::Error>;

    /// Read the status byte.
    fn read_status_byte(&mut self) -> Result<u8, Self::Error>;

    /// Throw away anything sitting in the input buffer, waiting at most `timeout` for it to
    /// settle. Returns what was thrown away.
    fn discard_unread(&mut self, timeout: Millis) -> Result<String, Self::Error>;

    /// Current I/O timeout.
    fn timeout(&self) -> Millis;

    /// Replace the I/O timeout.
    fn set_timeout(&mut self, timeout: Millis);
}

/// Temporarily replaces a transport's I/O timeout, restoring the prior value when dropped.
///
/// Guards nest like a stack: each one restores exactly the value it displaced, on every exit path.
pub struct TimeoutGuard<'a, T: Transport> {
    transport: &'a mut T,
    restore: Millis,
}

impl<'a, T: Transport> TimeoutGuard<'a, T> {
    pub fn new(transport: &'a mut T, timeout: Millis) -> Self {
        let restore = transport.timeout();
        transport.set_timeout(timeout);
        Self { transport, restore }
    }
}

impl<T: Transport> Deref for TimeoutGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.transport
    }
}

impl<T: Transport> DerefMut for TimeoutGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.transport
    }
}

impl<T: Transport> Drop for TimeoutGuard<'_, T> {
    fn drop(&mut self) {
        self.transport.set_timeout(self.restore);
    }
}

/// Errors raised by [`LineTransport`].
#[derive(Error, Debug)]
pub enum LineError<E: embedded_io::Error> {
    /// The underlying byte stream failed.
    #[error("Byte stream error: {0:?}")]
    Io(E),
    /// No complete line arrived in time.
    #[error("No complete line received before the timeout")]
    Timeout,
    /// A line did not fit the receive buffer.
    #[error("Line does not fit the receive buffer")]
    BufferOverflow,
    /// Bytes were not valid UTF-8 or a status reply was not a number.
    #[error("Received invalid data")]
    InvalidData,
}

impl<E: embedded_io::Error> embedded_io::Error for LineError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            LineError::Io(e) => e.kind(),
            LineError::Timeout => ErrorKind::TimedOut,
            LineError::BufferOverflow => ErrorKind::OutOfMemory,
            LineError::InvalidData => ErrorKind::InvalidData,
        }
    }
}

/// A [`Transport`] over any `embedded_io` byte stream (UART, RS-232 bridge, raw TCP socket).
///
/// Lines are assembled in a fixed `L` byte buffer. Streams without a hardware serial poll obtain
/// the status byte by sending `status_query` and parsing the decimal reply. Replies which were
/// already in flight when the status was queried are held back and returned by the next
/// [`Transport::read_line`].
pub struct LineTransport<S: embedded_io::Read + embedded_io::Write, C: Clock, const L: usize = 256> {
    interface: S,
    clock: C,
    terminator: &'static str,
    status_query: &'static str,
    timeout: Millis,
    /// Bytes received after the last terminator.
    pending: heapless::Vec<u8, L>,
    /// Complete lines received ahead of a status reply.
    held: heapless::Deque<String, HELD_LINES>,
}

/// Replies that may be held back while reading one status byte.
const HELD_LINES: usize = 8;

/// Decode a status reply. Only whole numbers in `0..=255` are status bytes.
fn parse_status(reply: &str) -> Option<u8> {
    let value: f64 = reply.trim().parse().ok()?;
    if value.fract() != 0.0 || !(0.0..=255.0).contains(&value) {
        return None;
    }
    Some(value as u8)
}

impl<S: embedded_io::Read + embedded_io::Write, C: Clock, const L: usize> LineTransport<S, C, L> {
    /// Create a transport using `\n` as terminator and `*STB?` for the status byte.
    pub fn new(interface: S, clock: C) -> Self {
        Self {
            interface,
            clock,
            terminator: "\n",
            status_query: "*STB?",
            timeout: Millis::millis(2_000),
            pending: heapless::Vec::new(),
            held: heapless::Deque::new(),
        }
    }

    pub fn with_terminator(mut self, terminator: &'static str) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn with_status_query(mut self, query: &'static str) -> Self {
        self.status_query = query;
        self
    }

    /// Consume the transport, returning the byte stream.
    pub fn release(self) -> S {
        self.interface
    }

    /// Offset of the first terminator in `pending`.
    fn find_terminator(&self) -> Option<usize> {
        let terminator = self.terminator.as_bytes();
        if terminator.is_empty() {
            return None;
        }
        self.pending
            .windows(terminator.len())
            .position(|window| window == terminator)
    }

    /// Split off the first complete line in `pending`, if there is one.
    fn take_line(&mut self) -> Result<Option<String>, LineError<S::Error>> {
        let Some(end) = self.find_terminator() else {
            return Ok(None);
        };
        let line = core::str::from_utf8(&self.pending[..end])
            .map_err(|_| LineError::InvalidData)?
            .trim_end_matches('\r')
            .to_string();
        let rest: heapless::Vec<u8, L> =
            heapless::Vec::from_slice(&self.pending[end + self.terminator.len()..])
                .map_err(|_| LineError::BufferOverflow)?;
        self.pending = rest;
        Ok(Some(line))
    }

    /// Pull whatever the stream has. Returns `Ok(0)` when nothing is available right now.
    fn fill(&mut self) -> Result<usize, LineError<S::Error>> {
        let mut temp_buf = [0u8; 32];
        match self.interface.read(&mut temp_buf) {
            Ok(bytes_read) => {
                self.pending
                    .extend_from_slice(&temp_buf[..bytes_read])
                    .map_err(|_| LineError::BufferOverflow)?;
                Ok(bytes_read)
            }
            // Non-blocking streams report "nothing yet" through these kinds.
            Err(e) if matches!(e.kind(), ErrorKind::Other | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(LineError::Io(e)),
        }
    }

    /// Wait for the next line on the stream, ignoring held lines.
    fn receive_line(&mut self) -> Result<String, LineError<S::Error>> {
        let start = self.clock.now();
        loop {
            if let Some(line) = self.take_line()? {
                log::trace!("< {line}");
                return Ok(line);
            }
            if self.fill()? == 0 {
                if self.clock.elapsed_since(start) >= self.timeout {
                    return Err(LineError::Timeout);
                }
                self.clock.delay(Millis::millis(1));
            }
        }
    }

    fn hold(&mut self, line: String) -> Result<(), LineError<S::Error>> {
        log::debug!("holding {line:?} until the status reply arrives");
        self.held.push_back(line).map_err(|_| LineError::BufferOverflow)
    }
}

impl<S: embedded_io::Read + embedded_io::Write, C: Clock, const L: usize> Transport
    for LineTransport<S, C, L>
{
    type Error = LineError<S::Error>;

    fn write_line(&mut self, line: &str) -> Result<(), Self::Error> {
        log::trace!("> {line}");
        self.interface
            .write_all(line.as_bytes())
            .map_err(LineError::Io)?;
        self.interface
            .write_all(self.terminator.as_bytes())
            .map_err(LineError::Io)?;
        self.interface.flush().map_err(LineError::Io)
    }

    fn read_line(&mut self) -> Result<String, Self::Error> {
        match self.held.pop_front() {
            Some(line) => Ok(line),
            None => self.receive_line(),
        }
    }

    /// The instrument answers in order, so the status reply is the last line received. Anything
    /// ahead of it, or anything that is not a whole number, is held for [`Transport::read_line`].
    fn read_status_byte(&mut self) -> Result<u8, Self::Error> {
        self.write_line(self.status_query)?;
        loop {
            let line = self.receive_line()?;
            self.fill()?;
            match parse_status(&line) {
                Some(status) if self.find_terminator().is_none() => return Ok(status),
                _ => self.hold(line)?,
            }
        }
    }

    fn discard_unread(&mut self, timeout: Millis) -> Result<String, Self::Error> {
        let start = self.clock.now();
        let mut discarded = heapless::Vec::<u8, L>::new();
        while let Some(line) = self.held.pop_front() {
            // Held lines are a diagnostic; drop what does not fit.
            let _ = discarded.extend_from_slice(line.as_bytes());
            let _ = discarded.extend_from_slice(self.terminator.as_bytes());
        }
        loop {
            // Only the most recent L bytes are kept for diagnostics.
            let overflow = discarded.extend_from_slice(&self.pending).is_err();
            self.pending.clear();
            if overflow {
                discarded.clear();
            }
            if self.fill()? == 0 && self.clock.elapsed_since(start) >= timeout {
                break;
            }
            if self.pending.is_empty() {
                self.clock.delay(Millis::millis(1));
            }
        }
        Ok(String::from_utf8_lossy(&discarded).into_owned())
    }

    fn timeout(&self) -> Millis {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Millis) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::MockSerial;
    use crate::mock_transport::SimulatedClock;
    use crate::{config::SessionConfig, session::Session};

    fn transport_with(data: &[u8]) -> LineTransport<MockSerial, SimulatedClock, 128> {
        let mut mock_serial = MockSerial::new();
        mock_serial.set_read_data(data).unwrap();
        LineTransport::new(mock_serial, SimulatedClock::new())
    }

    #[test]
    fn write_line_appends_terminator() {
        let mut transport = transport_with(b"");
        transport.write_line("print(1)").unwrap();
        assert_eq!(transport.interface.written_data(), b"print(1)\n");
    }

    #[test]
    fn custom_terminator_is_used() {
        let mut transport = transport_with(b"").with_terminator("\r\n");
        transport.write_line("*CLS").unwrap();
        assert_eq!(transport.interface.written_data(), b"*CLS\r\n");
    }

    #[test]
    fn read_line_splits_lines_and_strips_cr() {
        let mut transport = transport_with(b"first\r\nsecond\n");
        assert_eq!(transport.read_line().unwrap(), "first");
        assert_eq!(transport.read_line().unwrap(), "second");
    }

    #[test]
    fn read_line_times_out_without_terminator() {
        let mut transport = transport_with(b"partial");
        transport.set_timeout(Millis::millis(20));
        let result = transport.read_line();
        assert!(matches!(result, Err(LineError::Timeout)));
        assert_eq!(transport.clock.now().ticks(), 20);
    }

    #[test]
    fn read_status_byte_parses_decimal_reply() {
        let mut transport = transport_with(b"80\n");
        assert_eq!(transport.read_status_byte().unwrap(), 80);
        assert_eq!(transport.interface.written_data(), b"*STB?\n");
    }

    #[test]
    fn read_status_byte_accepts_real_notation() {
        let mut transport = transport_with(b"6.40000e+01\n").with_status_query("print(status.condition)");
        assert_eq!(transport.read_status_byte().unwrap(), 64);
    }

    #[test]
    fn read_status_byte_never_takes_text_as_status() {
        let mut transport = transport_with(b"nil\n");
        transport.set_timeout(Millis::millis(20));
        assert!(matches!(transport.read_status_byte(), Err(LineError::Timeout)));
        assert_eq!(transport.read_line().unwrap(), "nil");
    }

    #[test]
    fn fractional_status_reply_is_not_truncated() {
        let mut transport = transport_with(b"1.5\n");
        transport.set_timeout(Millis::millis(20));
        assert!(matches!(transport.read_status_byte(), Err(LineError::Timeout)));
        assert_eq!(transport.read_line().unwrap(), "1.5");
    }

    #[test]
    fn reply_in_flight_is_held_behind_status() {
        let mut transport = transport_with(b"16\n80\n");
        assert_eq!(transport.read_status_byte().unwrap(), 80);
        assert_eq!(transport.read_line().unwrap(), "16");
    }

    #[test]
    fn carriage_return_terminator_splits_lines() {
        let mut transport = transport_with(b"first\rsecond\r").with_terminator("\r");
        assert_eq!(transport.read_line().unwrap(), "first");
        assert_eq!(transport.read_line().unwrap(), "second");
    }

    #[test]
    fn multi_byte_terminator_splits_lines() {
        let mut transport = transport_with(b"a\nb\r\nc\r\n").with_terminator("\r\n");
        assert_eq!(transport.read_line().unwrap(), "a\nb");
        assert_eq!(transport.read_line().unwrap(), "c");
    }

    fn session_with(
        data: &[u8],
    ) -> Session<LineTransport<MockSerial, SimulatedClock, 128>, SimulatedClock> {
        let clock = SimulatedClock::new();
        let mut mock_serial = MockSerial::new();
        mock_serial.set_read_data(data).unwrap();
        let transport = LineTransport::new(mock_serial, clock.clone());
        Session::new(transport, clock, SessionConfig::default())
    }

    #[test]
    fn session_query_with_status_check_keeps_reply() {
        let mut session = session_with(b"1.5\n16\n");
        let result = session
            .query_with_status_check(Millis::millis(100), Millis::millis(50), "print(x)")
            .unwrap();
        assert_eq!(result.received_text, "1.5");
        assert_eq!(session.last_status().map(|s| s.bits()), Some(16));
        assert_eq!(
            session.transport().interface.written_data(),
            b"print(x)\n*STB?\n"
        );
    }

    #[test]
    fn session_write_with_status_check_consumes_operation_complete() {
        let mut session = session_with(b"1\n16\n");
        session
            .write_with_status_check(Millis::millis(100), "smua.source.levelv = 1")
            .unwrap();
        assert_eq!(
            session.transport().interface.written_data(),
            b"smua.source.levelv = 1\n*OPC?\n*STB?\n"
        );
        session.transport_mut().set_timeout(Millis::millis(5));
        assert!(matches!(session.transport_mut().read_line(), Err(LineError::Timeout)));
    }

    #[test]
    fn discard_unread_includes_held_lines() {
        let mut transport = transport_with(b"late\n64\n");
        assert_eq!(transport.read_status_byte().unwrap(), 64);
        let discarded = transport.discard_unread(Millis::millis(5)).unwrap();
        assert_eq!(discarded, "late\n");
        transport.set_timeout(Millis::millis(5));
        assert!(matches!(transport.read_line(), Err(LineError::Timeout)));
    }

    #[test]
    fn discard_unread_returns_pending_text() {
        let mut transport = transport_with(b"stale reply\n");
        let discarded = transport.discard_unread(Millis::millis(5)).unwrap();
        assert_eq!(discarded, "stale reply\n");
        transport.set_timeout(Millis::millis(5));
        assert!(matches!(transport.read_line(), Err(LineError::Timeout)));
    }

    #[test]
    fn read_errors_are_propagated() {
        let mut transport = transport_with(b"data\n");
        transport.interface.set_read_error(true);
        assert!(matches!(transport.read_line(), Err(LineError::Io(_))));
    }

    #[test]
    fn timeout_guard_restores_previous_value() {
        let mut transport = transport_with(b"");
        transport.set_timeout(Millis::millis(100));
        {
            let mut outer = TimeoutGuard::new(&mut transport, Millis::millis(10));
            assert_eq!(outer.timeout(), Millis::millis(10));
            {
                let inner = TimeoutGuard::new(&mut *outer, Millis::millis(1));
                assert_eq!(inner.timeout(), Millis::millis(1));
            }
            assert_eq!(outer.timeout(), Millis::millis(10));
        }
        assert_eq!(transport.timeout(), Millis::millis(100));
    }

    #[test]
    fn timeout_guard_restores_on_error_path() {
        type Mocked = LineTransport<MockSerial, SimulatedClock, 128>;

        fn failing_read(
            transport: &mut Mocked,
        ) -> Result<String, LineError<crate::mock_serial::MockSerialError>> {
            let mut io = TimeoutGuard::new(transport, Millis::millis(3));
            io.read_line()
        }

        let mut transport = transport_with(b"");
        transport.set_timeout(Millis::millis(250));
        assert!(failing_read(&mut transport).is_err());
        assert_eq!(transport.timeout(), Millis::millis(250));
    }
}
