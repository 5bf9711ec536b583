//! SCPI sessions.
//!
//! [`ScpiTransport`] moves command strings; [`InstrumentSession`] adds the
//! SCPI conventions on top (typed queries, `*RST`, `*CLS`, and the
//! operation-complete handshake every state-changing command is followed by).

use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default raw SCPI socket port.
pub const DEFAULT_PORT: u16 = 5025;

/// Line terminator appended to every command.
const TERMINATOR: &str = "\n";

/// Moves SCPI strings to and from one instrument.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> AppResult<()>;

    /// Send a query and return the trimmed response line.
    async fn query(&self, command: &str) -> AppResult<String>;
}

/// Raw SCPI over a TCP socket.
pub struct TcpScpiTransport {
    name: String,
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
}

impl TcpScpiTransport {
    /// Connect to `address` (`host` or `host:port`).
    ///
    /// `read_timeout` bounds the connect and every response read.
    pub async fn connect(name: &str, address: &str, read_timeout: Duration) -> AppResult<Self> {
        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{DEFAULT_PORT}")
        };

        let stream = timeout(read_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| BenchError::TransportTimeout {
                instrument: name.to_string(),
            })?
            .map_err(|e| BenchError::io(name, format!("Failed to connect to {target}: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| BenchError::io(name, e))?;

        tracing::info!(instrument = name, address = %target, "Connected");

        Ok(Self {
            name: name.to_string(),
            stream: Mutex::new(BufReader::new(stream)),
            timeout: read_timeout,
        })
    }

    async fn send(&self, stream: &mut BufReader<TcpStream>, command: &str) -> AppResult<()> {
        let line = format!("{command}{TERMINATOR}");
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BenchError::io(&self.name, format!("Failed to write '{command}': {e}")))?;
        stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| BenchError::io(&self.name, format!("Failed to flush: {e}")))
    }
}

#[async_trait]
impl ScpiTransport for TcpScpiTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        let mut stream = self.stream.lock().await;
        tracing::trace!(instrument = %self.name, command, "SCPI write");
        self.send(&mut stream, command).await
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let mut stream = self.stream.lock().await;
        tracing::trace!(instrument = %self.name, command, "SCPI query");
        self.send(&mut stream, command).await?;

        let mut response = String::new();
        match timeout(self.timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(BenchError::io(&self.name, "Connection closed by device")),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::trace!(instrument = %self.name, response = %trimmed, "SCPI response");
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(BenchError::io(
                &self.name,
                format!("Failed to read response to '{command}': {e}"),
            )),
            Err(_) => Err(BenchError::TransportTimeout {
                instrument: self.name.clone(),
            }),
        }
    }
}

/// A named SCPI conversation with one instrument.
#[derive(Clone)]
pub struct InstrumentSession {
    name: String,
    transport: Arc<dyn ScpiTransport>,
}

impl std::fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl InstrumentSession {
    /// Wrap a transport.
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    /// Instrument name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command.
    pub async fn write(&self, command: &str) -> AppResult<()> {
        self.transport.write(command).await
    }

    /// Send a query.
    pub async fn query(&self, command: &str) -> AppResult<String> {
        self.transport.query(command).await
    }

    /// Query a floating-point value.
    pub async fn query_f64(&self, command: &str) -> AppResult<f64> {
        let response = self.query(command).await?;
        parse_f64_response(&response).ok_or_else(|| {
            BenchError::io(
                &self.name,
                format!("Failed to parse '{response}' as f64 from query: {command}"),
            )
        })
    }

    /// Query a status register.
    pub async fn query_u32(&self, command: &str) -> AppResult<u32> {
        let response = self.query(command).await?;
        parse_register(&response).ok_or_else(|| {
            BenchError::io(
                &self.name,
                format!("Failed to parse '{response}' as register from query: {command}"),
            )
        })
    }

    /// `*RST` followed by the operation-complete wait.
    pub async fn reset(&self) -> AppResult<()> {
        self.write_and_wait("*RST").await
    }

    /// `*CLS`.
    pub async fn clear(&self) -> AppResult<()> {
        self.write("*CLS").await
    }

    /// Block until `*OPC?` answers `1`.
    pub async fn wait_operation_complete(&self) -> AppResult<()> {
        let response = self.query("*OPC?").await?;
        match parse_register(&response) {
            Some(1) => Ok(()),
            _ => Err(BenchError::io(
                &self.name,
                format!("Unexpected *OPC? response '{response}'"),
            )),
        }
    }

    /// Send a state-changing command and wait for it to complete.
    pub async fn write_and_wait(&self, command: &str) -> AppResult<()> {
        self.write(command).await?;
        self.wait_operation_complete().await
    }

    /// Read `SYST:ERR?` and surface a non-zero entry as `InstrumentIo`.
    pub async fn check_error(&self) -> AppResult<()> {
        let response = self.query("SYST:ERR?").await?;
        let code = response
            .split(',')
            .next()
            .and_then(|c| c.trim().trim_start_matches('+').parse::<i32>().ok());
        match code {
            Some(0) => Ok(()),
            _ => Err(BenchError::io(&self.name, response)),
        }
    }
}

/// Parse a SCPI numeric response (`+1.234E+01`, `5`, ...).
pub fn parse_f64_response(response: &str) -> Option<f64> {
    response.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a register value. Some instruments answer `+512` or `5.12E+02`.
pub fn parse_register(response: &str) -> Option<u32> {
    let trimmed = response.trim().trim_start_matches('+');
    if let Ok(value) = trimmed.parse::<u32>() {
        return Some(value);
    }
    let value = trimmed.parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 && value <= f64::from(u32::MAX) && value.fract() == 0.0 {
        Some(value as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::ScriptedTransport;

    #[test]
    fn test_parse_register() {
        assert_eq!(parse_register("512"), Some(512));
        assert_eq!(parse_register("+512\n"), Some(512));
        assert_eq!(parse_register("5.12E+02"), Some(512));
        assert_eq!(parse_register("-1"), None);
        assert_eq!(parse_register("ON"), None);
    }

    #[test]
    fn test_parse_f64_response() {
        assert_eq!(parse_f64_response("+1.000000E+01"), Some(10.0));
        assert_eq!(parse_f64_response("9.9E37").map(|v| v > 1e37), Some(true));
        assert_eq!(parse_f64_response("nan"), None);
    }

    #[tokio::test]
    async fn test_write_and_wait_issues_opc_query() {
        let transport = Arc::new(ScriptedTransport::new("psu"));
        let session = InstrumentSession::new("psu", transport.clone());

        session.write_and_wait("VOLT 5,(@1)").await.unwrap();

        assert_eq!(transport.log(), vec!["VOLT 5,(@1)", "*OPC?"]);
    }

    #[tokio::test]
    async fn test_bad_opc_response_is_io_error() {
        let transport = Arc::new(ScriptedTransport::new("psu"));
        transport.respond("*OPC?", "0");
        let session = InstrumentSession::new("psu", transport);

        let err = session.wait_operation_complete().await.unwrap_err();
        assert!(matches!(err, BenchError::InstrumentIo { .. }));
    }

    #[tokio::test]
    async fn test_check_error_surfaces_raw_text() {
        let transport = Arc::new(ScriptedTransport::new("dmm"));
        transport.respond("SYST:ERR?", "-113,\"Undefined header\"");
        let session = InstrumentSession::new("dmm", transport);

        let err = session.check_error().await.unwrap_err();
        assert!(err.to_string().contains("Undefined header"));
    }
}
