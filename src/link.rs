//! Byte-stream links to a datalogger.
//!
//! The protocol layers only require the small [`Link`](Link) surface:
//! something that opens, closes, reads with a bounded wait and writes.
//! TCP and serial implementations are provided, along with a URL
//! parser for the `tcp:host:port` and `serial:/dev/X:baud:8N1` forms.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::info;

use crate::error::{Error, Result};

/// A byte stream with a bounded read wait.
pub trait Link {
    /// Establishes the connection. Opening an already-open link is a
    /// no-op.
    fn open(&mut self) -> io::Result<()>;

    /// Tears the connection down. The link can be re-opened afterwards.
    fn close(&mut self);

    /// Reads up to `buf.len()` bytes. `Ok(0)` or a
    /// `WouldBlock`/`TimedOut` error means no data arrived within the
    /// configured timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `data`.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// The configured read timeout.
    fn timeout(&self) -> Duration;

    /// Human-readable name of the endpoint, for log messages.
    fn label(&self) -> String;
}

impl<T: Link + ?Sized> Link for Box<T> {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_all(data)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn label(&self) -> String {
        (**self).label()
    }
}

/// A TCP link to a PakBus/TCP bridge or a network-enabled logger.
pub struct TcpLink {
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        TcpLink {
            addr: addr.into(),
            timeout,
            stream: None,
        }
    }
}

impl Link for TcpLink {
    fn open(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        info!("opening tcp link to {}", self.addr);
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_read_timeout(Some(self.timeout))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Some(stream) => stream.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            Some(stream) => stream.write_all(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn label(&self) -> String {
        format!("tcp:{}", self.addr)
    }
}

/// A serial link, 8 data bits, no parity, one stop bit.
#[cfg(feature = "serial")]
pub struct SerialLink {
    path: String,
    baud: u32,
    timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "serial")]
impl SerialLink {
    pub fn new(path: impl Into<String>, baud: u32, timeout: Duration) -> Self {
        SerialLink {
            path: path.into(),
            baud,
            timeout,
            port: None,
        }
    }
}

#[cfg(feature = "serial")]
impl Link for SerialLink {
    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        info!("opening serial link {} at {} baud", self.path, self.baud);
        let port = serialport::new(self.path.as_str(), self.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(self.timeout)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.port {
            Some(port) => port.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.port {
            Some(port) => port.write_all(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn label(&self) -> String {
        format!("serial:{}:{}", self.path, self.baud)
    }
}

/// Builds a link from a connection URL.
///
/// Supported forms are `tcp:host:port` and
/// `serial:/dev/ttyUSB0:19200:8N1` (the framing suffix is optional and
/// only `8N1` is accepted).
pub fn link_from_url(url: &str, timeout: Duration) -> Result<Box<dyn Link>> {
    let mut parts = url.splitn(2, ':');
    let scheme = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();
    match scheme {
        "tcp" => {
            if rest.is_empty() || !rest.contains(':') {
                return Err(Error::BadUrl(url.into()));
            }
            Ok(Box::new(TcpLink::new(rest, timeout)))
        }
        #[cfg(feature = "serial")]
        "serial" => {
            let mut fields = rest.rsplitn(3, ':');
            let mut framing = fields.next().ok_or_else(|| Error::BadUrl(url.into()))?;
            let mut baud = fields.next();
            let mut path = fields.next();
            if path.is_none() {
                // no framing suffix: rest is path:baud
                path = baud;
                baud = Some(framing);
                framing = "8N1";
            }
            if framing != "8N1" {
                return Err(Error::BadUrl(url.into()));
            }
            let path = path.filter(|p| !p.is_empty()).ok_or_else(|| Error::BadUrl(url.into()))?;
            let baud = baud
                .and_then(|b| b.parse::<u32>().ok())
                .ok_or_else(|| Error::BadUrl(url.into()))?;
            Ok(Box::new(SerialLink::new(path, baud, timeout)))
        }
        #[cfg(not(feature = "serial"))]
        "serial" => Err(Error::BadUrl(format!(
            "{} (serial support not compiled in)",
            url
        ))),
        _ => Err(Error::BadUrl(url.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_urls() {
        let link = link_from_url("tcp:192.168.0.21:6785", Duration::from_secs(10)).unwrap();
        assert_eq!(link.label(), "tcp:192.168.0.21:6785");
    }

    #[cfg(feature = "serial")]
    #[test]
    fn parses_serial_urls() {
        let link = link_from_url("serial:/dev/ttyUSB0:19200:8N1", Duration::from_secs(10)).unwrap();
        assert_eq!(link.label(), "serial:/dev/ttyUSB0:19200");

        let link = link_from_url("serial:/dev/ttyUSB0:38400", Duration::from_secs(10)).unwrap();
        assert_eq!(link.label(), "serial:/dev/ttyUSB0:38400");
    }

    #[test]
    fn rejects_bad_urls() {
        for url in ["", "tcp:", "tcp:hostonly", "ftp:host:21", "serial:"] {
            assert!(link_from_url(url, Duration::from_secs(10)).is_err(), "{}", url);
        }
    }

    #[cfg(feature = "serial")]
    #[test]
    fn rejects_unsupported_serial_framing() {
        assert!(link_from_url("serial:/dev/ttyUSB0:19200:7E2", Duration::from_secs(1)).is_err());
    }
}
