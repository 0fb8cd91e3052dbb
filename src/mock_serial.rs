//! Byte-level stand-in for a UART or socket, used to test [`LineTransport`](crate::transport::LineTransport).

/// Our mock type used to emulate a serial port.
pub struct MockSerial {
    /// Everything the transport wrote.
    write_buffer: heapless::Vec<u8, 256>,
    /// Bytes the instrument will "send".
    read_buffer: heapless::Vec<u8, 256>,
    read_position: usize,
    /// Most bytes handed out by one `read` call, emulating a slow link.
    chunk_size: usize,
    should_error_on_write: bool,
    should_error_on_read: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum MockSerialError {
    /// Simulated framing/parity fault.
    #[error("Framing error")]
    Framing,
    /// Write did not fit the capture buffer.
    #[error("Buffer overflow")]
    BufferOverflow,
    /// Nothing to read right now.
    #[error("Would block")]
    WouldBlock,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Framing => embedded_io::ErrorKind::InvalidData,
            MockSerialError::BufferOverflow => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::WouldBlock => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::Framing);
        }
        self.write_buffer
            .extend_from_slice(buf)
            .map_err(|_| MockSerialError::BufferOverflow)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::Framing);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::Framing);
        }
        if self.read_position >= self.read_buffer.len() {
            return Err(MockSerialError::WouldBlock);
        }

        let available_bytes = self.read_buffer.len() - self.read_position;
        let bytes_to_read = buf.len().min(available_bytes).min(self.chunk_size);
        let start = self.read_position;
        buf[..bytes_to_read].copy_from_slice(&self.read_buffer[start..start + bytes_to_read]);
        self.read_position += bytes_to_read;
        Ok(bytes_to_read)
    }
}

impl MockSerial {
    pub fn new() -> Self {
        Self {
            write_buffer: heapless::Vec::new(),
            read_buffer: heapless::Vec::new(),
            read_position: 0,
            chunk_size: usize::MAX,
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    /// Replace the bytes that will be returned by `read`.
    pub fn set_read_data(&mut self, data: &[u8]) -> Result<(), MockSerialError> {
        self.read_buffer.clear();
        self.read_position = 0;
        self.read_buffer
            .extend_from_slice(data)
            .map_err(|_| MockSerialError::BufferOverflow)
    }

    /// Limit how many bytes a single `read` returns.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub fn written_data(&self) -> &[u8] {
        &self.write_buffer
    }

    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    pub fn set_read_error(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::SimulatedClock;
    use crate::transport::{LineError, LineTransport, Transport};
    use embedded_io::{Read, Write};

    #[test]
    fn chunked_reads_hand_out_limited_bytes() {
        let mut mock = MockSerial::new();
        mock.set_read_data(b"Hello World").unwrap();
        mock.set_chunk_size(5);

        let mut buffer = [0u8; 16];
        assert_eq!(mock.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"Hello");
        assert_eq!(mock.read(&mut buffer).unwrap(), 5);
        assert_eq!(mock.read(&mut buffer).unwrap(), 1);
        assert!(matches!(mock.read(&mut buffer), Err(MockSerialError::WouldBlock)));
    }

    #[test]
    fn write_overflow_is_reported() {
        let mut mock = MockSerial::new();
        let large_data = [0u8; 300];
        assert!(matches!(mock.write(&large_data), Err(MockSerialError::BufferOverflow)));
    }

    #[test]
    fn line_is_assembled_across_chunks() {
        let mut mock = MockSerial::new();
        mock.set_read_data(b"2.5000e-03\n").unwrap();
        mock.set_chunk_size(2);
        let mut transport: LineTransport<_, _, 64> = LineTransport::new(mock, SimulatedClock::new());
        assert_eq!(transport.read_line().unwrap(), "2.5000e-03");
    }

    #[test]
    fn write_fault_surfaces_through_transport() {
        let mut mock = MockSerial::new();
        mock.set_write_error(true);
        let mut transport: LineTransport<_, _, 64> = LineTransport::new(mock, SimulatedClock::new());
        assert!(matches!(
            transport.write_line("*RST"),
            Err(LineError::Io(MockSerialError::Framing))
        ));
    }

    #[test]
    fn oversized_line_overflows_receive_buffer() {
        let mut mock = MockSerial::new();
        mock.set_read_data(&[b'x'; 40]).unwrap();
        let mut transport: LineTransport<_, _, 16> = LineTransport::new(mock, SimulatedClock::new());
        assert!(matches!(transport.read_line(), Err(LineError::BufferOverflow)));
    }
}
