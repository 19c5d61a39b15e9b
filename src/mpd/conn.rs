//! Transport connection: one TCP socket speaking the MPD line protocol.
//!
//! Owns greeting negotiation, line framing and per-call deadlines.
//! Higher layers (Client, Watcher) own a Connection exclusively and
//! replace it wholesale when it fails.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::command::{Command, CommandList};
use super::error::{MpdError, Result};
use super::response::{parse_ack, Response};

const GREETING_PREFIX: &str = "OK MPD ";

/// Buffered reader that keeps partially received lines across calls.
struct LineReader {
    inner: BufReader<OwnedReadHalf>,
    pending: Vec<u8>,
}

impl LineReader {
    /// Read one line. `deadline == None` blocks until the server writes.
    async fn next_line(&mut self, deadline: Option<Duration>) -> Result<String> {
        let read = self.inner.read_until(b'\n', &mut self.pending);
        let n = match deadline {
            Some(d) => timeout(d, read)
                .await
                .map_err(|_| MpdError::Timeout("read", d))??,
            None => read.await?,
        };
        if n == 0 || !self.pending.ends_with(b"\n") {
            return Err(MpdError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        trace!("<- {}", line);
        Ok(line)
    }

    /// Collect lines up to the terminating `OK`. An ACK line ends the
    /// response with a protocol error.
    async fn until_ok(&mut self, deadline: Option<Duration>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.next_line(deadline).await?;
            if line == "OK" {
                return Ok(lines);
            }
            if line.starts_with("ACK ") {
                return Err(parse_ack(&line)
                    .map(MpdError::Ack)
                    .unwrap_or(MpdError::Unexpected(line)));
            }
            lines.push(line);
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str, deadline: Duration) -> Result<()> {
    trace!("-> {}", line);
    let write = async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    };
    timeout(deadline, write)
        .await
        .map_err(|_| MpdError::Timeout("write", deadline))??;
    Ok(())
}

/// A negotiated connection.
pub struct Connection {
    reader: LineReader,
    writer: OwnedWriteHalf,
    version: String,
    timeout: Duration,
}

impl Connection {
    /// Dial `addr`, read the greeting, and authenticate when a password
    /// is given. `timeout` bounds the connect and every later call.
    pub async fn dial(addr: &str, password: Option<&str>, deadline: Duration) -> Result<Self> {
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| MpdError::Timeout("connect", deadline))??;
        let (read_half, write_half) = stream.into_split();

        let mut conn = Self {
            reader: LineReader {
                inner: BufReader::new(read_half),
                pending: Vec::new(),
            },
            writer: write_half,
            version: String::new(),
            timeout: deadline,
        };

        let greeting = conn.reader.next_line(Some(deadline)).await?;
        conn.version = greeting
            .strip_prefix(GREETING_PREFIX)
            .ok_or_else(|| MpdError::Unexpected(greeting.clone()))?
            .to_string();

        if let Some(password) = password {
            conn.request(&Command::new("password").arg(password))
                .await?;
        }

        debug!("Connected to {} (protocol {})", addr, conn.version);
        Ok(conn)
    }

    /// Protocol version from the greeting line.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Send one command and read its response.
    pub async fn request(&mut self, command: &Command) -> Result<Response> {
        write_line(&mut self.writer, &command.to_line(), self.timeout).await?;
        let lines = self.reader.until_ok(Some(self.timeout)).await?;
        Ok(Response::from_lines(lines))
    }

    /// Send a command list and split the answer on `list_OK`.
    pub async fn request_list(&mut self, list: &CommandList) -> Result<Vec<Response>> {
        let batch = list.to_lines().join("\n");
        write_line(&mut self.writer, &batch, self.timeout).await?;

        let lines = self.reader.until_ok(Some(self.timeout)).await?;
        let mut responses = Vec::with_capacity(list.len());
        let mut current = Vec::new();
        for line in lines {
            if line == "list_OK" {
                responses.push(Response::from_lines(current.drain(..)));
            } else {
                current.push(line);
            }
        }
        if responses.len() != list.len() {
            return Err(MpdError::Unexpected(format!(
                "command list answered {} of {} commands",
                responses.len(),
                list.len()
            )));
        }
        Ok(responses)
    }

    /// Send a line that gets no reply (`close`).
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        write_line(&mut self.writer, &command.to_line(), self.timeout).await
    }

    /// Block in `idle` until a subsystem changes or `cancel` fires.
    ///
    /// On cancellation `noidle` is written on the same socket while the
    /// pending read keeps running, so the response is consumed in full and
    /// the connection stays in sync. Returns the changed subsystems (empty
    /// when interrupted before anything changed).
    pub async fn idle(
        &mut self,
        subsystems: &[&str],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let command = subsystems
            .iter()
            .fold(Command::new("idle"), |cmd, s| cmd.arg(s));
        write_line(&mut self.writer, &command.to_line(), self.timeout).await?;

        let deadline = self.timeout;
        let Self { reader, writer, .. } = self;
        let read = reader.until_ok(None);
        tokio::pin!(read);

        let lines = tokio::select! {
            res = &mut read => res?,
            _ = cancel.cancelled() => {
                write_line(writer, "noidle", deadline).await?;
                timeout(deadline, read)
                    .await
                    .map_err(|_| MpdError::Timeout("noidle", deadline))??
            }
        };

        Ok(lines
            .iter()
            .filter_map(|line| line.strip_prefix("changed: "))
            .map(str::to_string)
            .collect())
    }
}
