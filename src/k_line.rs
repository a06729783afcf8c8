use std::time::Duration;

/// Byte level access to a K-line adapter.
///
/// The line is half duplex and every written byte is echoed back on the
/// receive side.
pub trait KLine {
    type Error: std::error::Error;

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Self::Error>;
    fn baud_rate(&self) -> Result<u32, Self::Error>;

    /// Holds the line low (break condition)
    fn set_low(&mut self) -> Result<(), Self::Error>;
    /// Releases the line back to idle high
    fn set_high(&mut self) -> Result<(), Self::Error>;

    /// Discards everything in the receive and transmit buffers
    fn purge(&mut self) -> Result<(), Self::Error>;
    fn bytes_available(&mut self) -> Result<usize, Self::Error>;

    /// Reads up to `buf.len()` bytes, returning early with fewer once `timeout` passes.
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error>;
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, Self::Error>;

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, Self::Error> {
        let mut buf = [0u8];
        Ok(match self.read_bytes(&mut buf, timeout)? {
            0 => None,
            _ => Some(buf[0]),
        })
    }

    fn write_byte(&mut self, byte: u8) -> Result<bool, Self::Error> {
        Ok(self.write_bytes(&[byte])? == 1)
    }

    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(feature = "serialport")]
impl<A: serialport::SerialPort> KLine for A {
    type Error = serialport::Error;

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), Self::Error> {
        serialport::SerialPort::set_baud_rate(self, baud_rate)
    }

    fn baud_rate(&self) -> Result<u32, Self::Error> {
        serialport::SerialPort::baud_rate(self)
    }

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_break()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.clear_break()
    }

    fn purge(&mut self) -> Result<(), Self::Error> {
        self.clear(serialport::ClearBuffer::All)
    }

    fn bytes_available(&mut self) -> Result<usize, Self::Error> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Self::Error> {
        self.set_timeout(timeout)?;
        let mut read = 0;
        while read < buf.len() {
            match std::io::Read::read(self, &mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write_all(self, bytes)?;
        std::io::Write::flush(self)?;
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{collections::VecDeque, convert::Infallible};

    #[derive(Default)]
    struct Loopback {
        rx: VecDeque<u8>,
    }

    impl KLine for Loopback {
        type Error = Infallible;

        fn set_baud_rate(&mut self, _: u32) -> Result<(), Infallible> {
            Ok(())
        }
        fn baud_rate(&self) -> Result<u32, Infallible> {
            Ok(10400)
        }
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
        fn purge(&mut self) -> Result<(), Infallible> {
            self.rx.clear();
            Ok(())
        }
        fn bytes_available(&mut self) -> Result<usize, Infallible> {
            Ok(self.rx.len())
        }
        fn read_bytes(&mut self, buf: &mut [u8], _: Duration) -> Result<usize, Infallible> {
            let count = buf.len().min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..count)) {
                *slot = byte;
            }
            Ok(count)
        }
        fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize, Infallible> {
            self.rx.extend(bytes);
            Ok(bytes.len())
        }
    }

    #[test]
    fn single_bytes_go_through_the_buffered_calls() {
        let mut line = Loopback::default();
        let timeout = Duration::from_millis(1);

        assert_eq!(line.read_byte(timeout), Ok(None));
        assert_eq!(line.write_byte(0x55), Ok(true));
        assert_eq!(line.bytes_available(), Ok(1));
        assert_eq!(line.read_byte(timeout), Ok(Some(0x55)));
        assert_eq!(line.read_byte(timeout), Ok(None));
    }
}
