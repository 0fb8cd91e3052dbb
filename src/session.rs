//! The session protocol engine.
//!
//! A [`Session`] is the only thing that writes to or reads from a [`Transport`]. It implements the
//! write/query dialogue, status byte polling, refractory delays, error queue draining and the
//! emulated reply path used when no hardware is attached.
//!
//! Plain write/read pairs race against replies and service requests the instrument produces on its
//! own. The `*_with_status_check` variants wait for the status byte to announce a message (or an
//! error) before reading, so an unsolicited line is never mistaken for the expected reply.

use crate::{
    accessor::parse_integer,
    clock::{Clock, Millis, Timestamp},
    config::SessionConfig,
    error::{Error, ErrorQueueEntry, ParseError, Result},
    node::NodeNumber,
    status::{AwaitOutcome, ConditionBit, StandardEvents, StatusByte},
    transport::{TimeoutGuard, Transport},
};

/// Outcome of a write-only turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteResult {
    pub sent_text: String,
    pub elapsed: Millis,
}

/// Outcome of a turn which produced a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// Command the reply belongs to. Empty for a bare read.
    pub sent_text: String,
    pub received_text: String,
    pub elapsed: Millis,
}

/// A dialogue with one instrument (or one link controller) over one transport.
pub struct Session<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    config: SessionConfig,
    /// Node the transport talks to directly.
    controller_node: NodeNumber,
    /// Single-use substitute for the next read.
    emulated_reply: Option<String>,
    /// Status byte of the current turn. Cleared by every write.
    last_status: Option<StatusByte>,
    last_command: String,
    /// Local copy of everything drained from the instrument error queue.
    device_errors: Vec<ErrorQueueEntry>,
}

impl<T: Transport, C: Clock> Session<T, C> {
    pub fn new(transport: T, clock: C, config: SessionConfig) -> Self {
        Self {
            transport,
            clock,
            config,
            controller_node: NodeNumber::FIRST,
            emulated_reply: None,
            last_status: None,
            last_command: String::new(),
            device_errors: Vec::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Take the session apart, returning the transport and the clock.
    pub fn into_parts(self) -> (T, C) {
        (self.transport, self.clock)
    }

    pub fn controller_node(&self) -> NodeNumber {
        self.controller_node
    }

    pub fn set_controller_node(&mut self, node: NodeNumber) {
        self.controller_node = node;
    }

    pub fn is_controller(&self, node: NodeNumber) -> bool {
        node == self.controller_node
    }

    /// Make the next read return `reply` instead of touching the transport.
    pub fn set_emulated_reply(&mut self, reply: impl Into<String>) {
        self.emulated_reply = Some(reply.into());
    }

    pub fn emulated_reply(&self) -> Option<&str> {
        self.emulated_reply.as_deref()
    }

    /// Status byte read during the current turn, if any.
    pub fn last_status(&self) -> Option<StatusByte> {
        self.last_status
    }

    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    fn transport_error(&self, command: &str, error: T::Error) -> Error<T::Error> {
        Error::from_transport(command, error, self.transport.timeout())
    }

    /// Apply the refractory period so the next status byte reflects the last write.
    pub(crate) fn settle(&mut self) {
        if self.config.refractory_period.ticks() > 0 {
            self.clock.delay(self.config.refractory_period);
        }
    }

    fn elapsed_since(&self, start: Timestamp) -> Millis {
        self.clock.elapsed_since(start)
    }

    /// Send one line. No status interpretation.
    pub fn write_line(&mut self, command: &str) -> Result<ExecuteResult, T::Error> {
        let start = self.clock.now();
        self.last_status = None;
        self.last_command.clear();
        self.last_command.push_str(command);
        log::trace!("write `{command}`");
        if let Err(e) = self.transport.write_line(command) {
            return Err(self.transport_error(command, e));
        }
        Ok(ExecuteResult {
            sent_text: command.to_string(),
            elapsed: self.elapsed_since(start),
        })
    }

    /// Read one line, consuming the emulated reply instead if one is set.
    pub fn read_line(&mut self) -> Result<QueryResult, T::Error> {
        let start = self.clock.now();
        let received_text = match self.emulated_reply.take() {
            Some(reply) => {
                log::debug!("emulated reply {reply:?}");
                reply
            }
            None => match self.transport.read_line() {
                Ok(line) => line,
                Err(e) => {
                    let command = self.last_command.clone();
                    return Err(self.transport_error(&command, e));
                }
            },
        };
        Ok(QueryResult {
            sent_text: String::new(),
            received_text,
            elapsed: self.elapsed_since(start),
        })
    }

    /// Read one line with the transport timeout temporarily set to `timeout`.
    fn read_line_within(&mut self, timeout: Millis) -> Result<QueryResult, T::Error> {
        if self.emulated_reply.is_some() {
            return self.read_line();
        }
        let start = self.clock.now();
        let line = {
            let mut io = TimeoutGuard::new(&mut self.transport, timeout);
            io.read_line()
        };
        match line {
            Ok(received_text) => Ok(QueryResult {
                sent_text: String::new(),
                received_text,
                elapsed: self.elapsed_since(start),
            }),
            Err(e) => Err(Error::from_transport(&self.last_command, e, timeout)),
        }
    }

    /// Write then read.
    pub fn query_line(&mut self, command: &str) -> Result<QueryResult, T::Error> {
        let start = self.clock.now();
        self.write_line(command)?;
        let reply = self.read_line()?;
        Ok(QueryResult {
            sent_text: command.to_string(),
            received_text: reply.received_text,
            elapsed: self.elapsed_since(start),
        })
    }

    /// Read a fresh status byte and make it the snapshot of the current turn.
    pub fn read_status_byte(&mut self) -> Result<StatusByte, T::Error> {
        let status = match self.transport.read_status_byte() {
            Ok(bits) => StatusByte::new(bits),
            Err(e) => {
                let command = self.last_command.clone();
                return Err(self.transport_error(&command, e));
            }
        };
        log::trace!("status {status}");
        self.last_status = Some(status);
        Ok(status)
    }

    /// Poll the status byte until any bit of `predicate` is set or `timeout` elapses.
    ///
    /// A zero timeout reads the status byte exactly once. The final delay is clipped so the wait
    /// never runs past `timeout`.
    pub fn await_bitmask(
        &mut self,
        predicate: u8,
        poll_interval: Millis,
        timeout: Millis,
    ) -> Result<AwaitOutcome, T::Error> {
        let start = self.clock.now();
        let poll_interval = if poll_interval.ticks() == 0 {
            Millis::millis(1)
        } else {
            poll_interval
        };
        loop {
            let status = self.read_status_byte()?;
            let elapsed = self.elapsed_since(start);
            if status.intersects(predicate) {
                return Ok(AwaitOutcome {
                    timed_out: false,
                    status,
                    elapsed,
                });
            }
            let Some(remaining) = timeout.checked_sub(elapsed).filter(|r| r.ticks() > 0) else {
                log::debug!("status {status} lacks {predicate:#04X} after {elapsed:?}");
                return Ok(AwaitOutcome {
                    timed_out: true,
                    status,
                    elapsed,
                });
            };
            self.clock.delay(if poll_interval < remaining {
                poll_interval
            } else {
                remaining
            });
        }
    }

    /// [`Session::await_bitmask`] for named conditions using the configured poll interval.
    pub fn await_conditions(
        &mut self,
        conditions: &[ConditionBit],
        timeout: Millis,
    ) -> Result<AwaitOutcome, T::Error> {
        let mask = self.config.bitmasks.mask_of(conditions);
        self.await_bitmask(mask, self.config.poll_interval, timeout)
    }

    pub fn is_set(&self, status: StatusByte, bit: ConditionBit) -> bool {
        self.config.bitmasks.is_set(status, bit)
    }

    /// Write `command`, wait for a message or an error, and only then read the reply.
    ///
    /// Fails with [`Error::DeviceStatusError`] (after draining the error queue) when the error bit
    /// comes up, and with [`Error::CommunicationTimeout`] when neither bit shows within
    /// `ready_timeout`.
    pub fn query_with_status_check(
        &mut self,
        ready_timeout: Millis,
        read_timeout: Millis,
        command: &str,
    ) -> Result<QueryResult, T::Error> {
        let start = self.clock.now();
        self.write_line(command)?;
        if self.emulated_reply.is_none() {
            self.await_reply(ready_timeout, command)?;
        }
        let received_text = self.read_line_within(read_timeout)?.received_text;
        Ok(QueryResult {
            sent_text: command.to_string(),
            received_text,
            elapsed: self.elapsed_since(start),
        })
    }

    /// Write `command` followed by an operation complete query and wait until the instrument has
    /// finished it. Used after commands with side effects such as range changes.
    pub fn write_with_status_check(
        &mut self,
        ready_timeout: Millis,
        command: &str,
    ) -> Result<ExecuteResult, T::Error> {
        let start = self.clock.now();
        self.write_line(command)?;
        let opc = self.config.commands.operation_complete_query.clone();
        self.write_line(&opc)?;
        self.await_reply(ready_timeout, command)?;
        // The operation complete reply only signals readiness.
        self.read_line_within(self.config.read_timeout)?;
        Ok(ExecuteResult {
            sent_text: command.to_string(),
            elapsed: self.elapsed_since(start),
        })
    }

    /// Wait for message-available or error-available after a write. Returns once a message is
    /// waiting; any reported error is drained and returned as [`Error::DeviceStatusError`].
    fn await_reply(&mut self, ready_timeout: Millis, command: &str) -> Result<StatusByte, T::Error> {
        self.settle();
        let outcome = self.await_conditions(
            &[ConditionBit::MessageAvailable, ConditionBit::ErrorAvailable],
            ready_timeout,
        )?;
        if outcome.timed_out {
            return Err(Error::CommunicationTimeout {
                command: command.to_string(),
                timeout: ready_timeout,
                status: Some(outcome.status),
            });
        }
        if self.is_set(outcome.status, ConditionBit::ErrorAvailable) {
            if self.is_set(outcome.status, ConditionBit::MessageAvailable) {
                // Clear the output queue so the drain does not read a stale reply.
                let stale = self.read_line()?;
                log::debug!("dropping reply {:?} to `{command}`", stale.received_text);
            }
            let node = self.controller_node;
            let errors = self.drain_from(node, outcome.status)?;
            return Err(Error::DeviceStatusError {
                command: command.to_string(),
                status: outcome.status,
                errors,
            });
        }
        Ok(outcome.status)
    }

    /// Drain the instrument error queue into the local error cache.
    ///
    /// Returns the entries drained by this call, oldest first.
    pub fn drain_error_queue(&mut self, node: NodeNumber) -> Result<Vec<ErrorQueueEntry>, T::Error> {
        let status = self.read_status_byte()?;
        self.drain_from(node, status)
    }

    /// Drain while the error bit of `status` (and of each following status byte) is set.
    ///
    /// Every entry popped from the instrument reaches the local cache, even when the drain fails
    /// part way.
    pub(crate) fn drain_from(
        &mut self,
        node: NodeNumber,
        status: StatusByte,
    ) -> Result<Vec<ErrorQueueEntry>, T::Error> {
        let mut drained = Vec::new();
        let result = self.drain_into(node, status, &mut drained);
        self.device_errors.extend(drained.iter().cloned());
        result.map(|()| drained)
    }

    fn drain_into(
        &mut self,
        node: NodeNumber,
        mut status: StatusByte,
        drained: &mut Vec<ErrorQueueEntry>,
    ) -> Result<(), T::Error> {
        let is_controller = self.is_controller(node);
        let count_query = self.config.commands.error_count_query.for_node(node, is_controller);
        let next_query = self.config.commands.next_error_query.for_node(node, is_controller);
        let mut iterations = 0;

        while self.is_set(status, ConditionBit::ErrorAvailable) {
            if iterations >= self.config.max_error_drain {
                return Err(Error::ErrorQueueStuck {
                    node,
                    command: next_query,
                    iterations,
                    errors: drained.clone(),
                });
            }
            iterations += 1;

            let count = self.query_line(&count_query)?;
            let pending = parse_integer(&count.received_text).ok_or_else(|| {
                ParseError::new(&count_query, &count.received_text, "integer")
            })?;
            if pending == 0 {
                log::warn!("error bit set but node {node} reports an empty error queue");
                break;
            }

            let reply = self.query_line(&next_query)?;
            let entry = ErrorQueueEntry::parse(&next_query, &reply.received_text, node)?;
            if entry.code == 0 {
                break;
            }
            log::warn!("device error {entry}");
            drained.push(entry);
            status = self.read_status_byte()?;
        }
        Ok(())
    }

    /// Clear the instrument error queue and the local error cache. Idempotent.
    pub fn clear_error_queue(&mut self, node: NodeNumber) -> Result<(), T::Error> {
        let command = self
            .config
            .commands
            .clear_error_queue
            .for_node(node, self.is_controller(node));
        self.write_line(&command)?;
        self.settle();
        self.device_errors.clear();
        Ok(())
    }

    /// Flush unsolicited input before starting a dialogue. Never fails; returns what was dropped.
    pub fn discard_unread_data(&mut self, timeout: Millis) -> String {
        match self.transport.discard_unread(timeout) {
            Ok(text) => {
                if !text.is_empty() {
                    log::warn!("discarded unread data {text:?}");
                }
                text
            }
            Err(e) => {
                log::warn!("discarding unread data failed: {e:?}");
                String::new()
            }
        }
    }

    /// Read and decode the standard event register. Reading it clears the latched events.
    pub fn query_standard_events(&mut self) -> Result<StandardEvents, T::Error> {
        let command = self.config.commands.standard_event_query.clone();
        let reply = self.query_line(&command)?;
        let value = parse_integer(&reply.received_text)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| ParseError::new(&command, &reply.received_text, "event register"))?;
        Ok(StandardEvents::from_register(value))
    }

    /// `*IDN?` reply.
    pub fn identity(&mut self) -> Result<String, T::Error> {
        let command = self.config.commands.identity_query.clone();
        Ok(self.query_line(&command)?.received_text.trim().to_string())
    }

    /// Clear the status model (event registers and the error queue) without a reset.
    pub fn clear_execution_state(&mut self) -> Result<(), T::Error> {
        let command = self.config.commands.clear_execution_state.clone();
        self.write_line(&command)?;
        self.settle();
        self.device_errors.clear();
        Ok(())
    }

    /// Everything drained since the last clear, oldest first.
    pub fn device_errors(&self) -> &[ErrorQueueEntry] {
        &self.device_errors
    }

    pub fn has_device_errors(&self) -> bool {
        !self.device_errors.is_empty()
    }

    pub fn last_error(&self) -> Option<&ErrorQueueEntry> {
        self.device_errors.last()
    }

    /// One line per cached error.
    pub fn error_report(&self) -> String {
        self.device_errors
            .iter()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
