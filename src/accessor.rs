//! Typed instrument properties built on the session primitives.
//!
//! Every property (a voltage limit, a range, an output state...) follows one shape: `write`,
//! `query`, `parse` and `apply`. Rather than writing those four methods per property, a property is
//! described once by a [`PropertyDescriptor`] (command templates plus format/parse functions) and
//! driven by the generic [`Property`].
//!
//! ```ignore
//! const LEVEL_V: PropertyDescriptor<f64> =
//!     PropertyDescriptor::real("smua.source.levelv = {value}", "print(smua.source.levelv)");
//!
//! let mut level = Property::new(LEVEL_V);
//! let applied = level.apply(&mut session, 1.5, true)?;
//! ```

use crate::{
    clock::Clock,
    commands::render,
    error::{ParseError, Result},
    session::Session,
    transport::Transport,
};

/// Parse a real number as printed by TSP or SCPI (`1.5`, `1.50000e+00`, `+9.9E37`).
pub fn parse_real(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

/// Parse an integer, also accepting integral reals such as `3.00000e+00`.
pub fn parse_integer(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    let value = parse_real(text)?;
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Parse a boolean from `true`/`false`, `on`/`off` or a number (non-zero is true).
pub fn parse_boolean(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("on") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") || text.eq_ignore_ascii_case("off") {
        Some(false)
    } else {
        parse_real(text).map(|value| value != 0.0)
    }
}

fn format_real(value: &f64) -> String {
    value.to_string()
}

fn format_integer(value: &i64) -> String {
    value.to_string()
}

fn format_boolean(value: &bool) -> String {
    String::from(if *value { "1" } else { "0" })
}

/// Describes one typed property of an instrument.
#[derive(Debug)]
pub struct PropertyDescriptor<V> {
    /// Assignment command; `{value}` is replaced by the formatted value.
    pub write_template: &'static str,
    /// Command whose reply is the current value.
    pub query_command: &'static str,
    /// Grammar name used in parse errors.
    pub expected: &'static str,
    pub format: fn(&V) -> String,
    pub parse: fn(&str) -> Option<V>,
}

impl<V> Clone for PropertyDescriptor<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for PropertyDescriptor<V> {}

impl PropertyDescriptor<f64> {
    pub const fn real(write_template: &'static str, query_command: &'static str) -> Self {
        Self {
            write_template,
            query_command,
            expected: "real number",
            format: format_real,
            parse: parse_real,
        }
    }
}

impl PropertyDescriptor<i64> {
    pub const fn integer(write_template: &'static str, query_command: &'static str) -> Self {
        Self {
            write_template,
            query_command,
            expected: "integer",
            format: format_integer,
            parse: parse_integer,
        }
    }
}

impl PropertyDescriptor<bool> {
    pub const fn boolean(write_template: &'static str, query_command: &'static str) -> Self {
        Self {
            write_template,
            query_command,
            expected: "boolean",
            format: format_boolean,
            parse: parse_boolean,
        }
    }
}

impl<V> PropertyDescriptor<V> {
    /// The command which writes `value`.
    pub fn write_command(&self, value: &V) -> String {
        render(self.write_template, &[("value", &(self.format)(value))])
    }

    /// Parse `text` without I/O. Never fails.
    pub fn try_parse(&self, text: &str) -> Option<V> {
        (self.parse)(text)
    }

    /// Parse `text` without I/O; a [`ParseError`] carries the raw text and the query command.
    pub fn parse(&self, text: &str) -> core::result::Result<V, ParseError> {
        self.try_parse(text)
            .ok_or_else(|| ParseError::new(self.query_command, text, self.expected))
    }
}

/// A property with its last known value.
#[derive(Debug, Clone)]
pub struct Property<V> {
    descriptor: PropertyDescriptor<V>,
    value: Option<V>,
}

impl<V: Clone + PartialEq> Property<V> {
    pub fn new(descriptor: PropertyDescriptor<V>) -> Self {
        Self {
            descriptor,
            value: None,
        }
    }

    pub fn descriptor(&self) -> &PropertyDescriptor<V> {
        &self.descriptor
    }

    /// Last value written or read, if any.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Cache `value`, returning whether it differs from the cached one.
    pub fn set_value(&mut self, value: V) -> bool {
        let changed = self.value.as_ref() != Some(&value);
        self.value = Some(value);
        changed
    }

    /// Forget the cached value, e.g. after an instrument reset.
    pub fn invalidate(&mut self) {
        self.value = None;
    }

    pub fn try_parse(&self, text: &str) -> Option<V> {
        self.descriptor.try_parse(text)
    }

    pub fn parse(&self, text: &str) -> core::result::Result<V, ParseError> {
        self.descriptor.parse(text)
    }

    /// Send `value`. With `check_status` the write waits for operation complete and surfaces
    /// device errors.
    pub fn write<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
        value: V,
        check_status: bool,
    ) -> Result<V, T::Error> {
        let command = self.descriptor.write_command(&value);
        if check_status {
            let ready_timeout = session.config().ready_timeout;
            session.write_with_status_check(ready_timeout, &command)?;
        } else {
            session.write_line(&command)?;
        }
        self.set_value(value.clone());
        Ok(value)
    }

    /// Read the value from the instrument.
    pub fn query<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
        check_status: bool,
    ) -> Result<V, T::Error> {
        let command = self.descriptor.query_command;
        let reply = if check_status {
            let config = session.config();
            let (ready_timeout, read_timeout) = (config.ready_timeout, config.read_timeout);
            session.query_with_status_check(ready_timeout, read_timeout, command)?
        } else {
            session.query_line(command)?
        };
        let value = self.parse(&reply.received_text)?;
        self.set_value(value.clone());
        Ok(value)
    }

    /// Write then query, returning what the instrument actually holds.
    pub fn apply<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
        value: V,
        check_status: bool,
    ) -> Result<V, T::Error> {
        self.write(session, value, check_status)?;
        self.query(session, check_status)
    }
}
