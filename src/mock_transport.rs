//! Scripted instrument and simulated clock for unit tests.

use std::{
    cell::Cell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use embedded_io::ErrorKind;

use crate::{
    clock::{Clock, Millis, Timestamp},
    transport::Transport,
};

/// Clock whose time only moves when someone delays. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    now: Rc<Cell<u64>>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Millis) {
        self.now.set(self.now.get() + duration.ticks());
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_ticks(self.now.get())
    }

    fn delay(&mut self, duration: Millis) {
        self.advance(duration);
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockInstrumentError {
    #[error("No reply queued")]
    NoReply,
    #[error("Injected fault")]
    Fault,
}

impl embedded_io::Error for MockInstrumentError {
    fn kind(&self) -> ErrorKind {
        match self {
            MockInstrumentError::NoReply => ErrorKind::TimedOut,
            MockInstrumentError::Fault => ErrorKind::Other,
        }
    }
}

/// A [`Transport`] answering from scripts.
///
/// Status bytes come from a one-shot script, then from the idle status. Replies come from a FIFO
/// which is fed directly, by persistent `respond_to` rules, and (when enabled) by echoing
/// `print(x)` after `x = value` was written.
#[derive(Debug)]
pub struct MockInstrument {
    clock: SimulatedClock,
    timeout: Millis,
    written: Vec<String>,
    replies: VecDeque<String>,
    responses: Vec<(String, String)>,
    status_script: VecDeque<u8>,
    idle_status: u8,
    status_reads: usize,
    first_status_read_at: Option<u64>,
    read_timeouts: Vec<Millis>,
    echo_assignments: bool,
    assignments: HashMap<String, String>,
    write_error: bool,
    read_error: bool,
}

impl MockInstrument {
    pub fn new() -> Self {
        Self {
            clock: SimulatedClock::new(),
            timeout: Millis::millis(2_000),
            written: Vec::new(),
            replies: VecDeque::new(),
            responses: Vec::new(),
            status_script: VecDeque::new(),
            idle_status: 0,
            status_reads: 0,
            first_status_read_at: None,
            read_timeouts: Vec::new(),
            echo_assignments: false,
            assignments: HashMap::new(),
            write_error: false,
            read_error: false,
        }
    }

    /// Share `clock` with the session so status reads can be timestamped.
    pub fn with_clock(mut self, clock: SimulatedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn push_status(&mut self, bytes: &[u8]) {
        self.status_script.extend(bytes);
    }

    /// Status returned once the script is exhausted.
    pub fn set_idle_status(&mut self, status: u8) {
        self.idle_status = status;
    }

    pub fn push_reply(&mut self, reply: &str) {
        self.replies.push_back(reply.to_string());
    }

    /// Queue `reply` every time `command` is written.
    pub fn respond_to(&mut self, command: &str, reply: &str) {
        self.responses.push((command.to_string(), reply.to_string()));
    }

    pub fn set_echo_assignments(&mut self, echo: bool) {
        self.echo_assignments = echo;
    }

    pub fn set_write_error(&mut self, fail: bool) {
        self.write_error = fail;
    }

    pub fn set_read_error(&mut self, fail: bool) {
        self.read_error = fail;
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads
    }

    /// I/O timeout in effect at each `read_line`.
    pub fn read_timeouts(&self) -> &[Millis] {
        &self.read_timeouts
    }

    pub fn first_status_read_at(&self) -> Option<u64> {
        self.first_status_read_at
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    fn echo(&mut self, line: &str) {
        if let Some((target, value)) = line.split_once(" = ") {
            self.assignments.insert(target.trim().to_string(), value.trim().to_string());
        } else if let Some(target) = line.strip_prefix("print(").and_then(|l| l.strip_suffix(')')) {
            if let Some(value) = self.assignments.get(target) {
                self.replies.push_back(value.clone());
            }
        }
    }
}

impl Transport for MockInstrument {
    type Error = MockInstrumentError;

    fn write_line(&mut self, line: &str) -> Result<(), Self::Error> {
        if self.write_error {
            return Err(MockInstrumentError::Fault);
        }
        self.written.push(line.to_string());
        if self.echo_assignments {
            self.echo(line);
        }
        for (command, reply) in &self.responses {
            if command == line {
                self.replies.push_back(reply.clone());
            }
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, Self::Error> {
        if self.read_error {
            return Err(MockInstrumentError::Fault);
        }
        self.read_timeouts.push(self.timeout);
        match self.replies.pop_front() {
            Some(reply) => Ok(reply),
            None => {
                self.clock.advance(self.timeout);
                Err(MockInstrumentError::NoReply)
            }
        }
    }

    fn read_status_byte(&mut self) -> Result<u8, Self::Error> {
        if self.read_error {
            return Err(MockInstrumentError::Fault);
        }
        self.status_reads += 1;
        if self.first_status_read_at.is_none() {
            self.first_status_read_at = Some(self.clock.now().ticks());
        }
        Ok(self.status_script.pop_front().unwrap_or(self.idle_status))
    }

    fn discard_unread(&mut self, _timeout: Millis) -> Result<String, Self::Error> {
        if self.read_error {
            return Err(MockInstrumentError::Fault);
        }
        Ok(self.replies.drain(..).collect::<Vec<_>>().join("\n"))
    }

    fn timeout(&self) -> Millis {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Millis) {
        self.timeout = timeout;
    }
}
