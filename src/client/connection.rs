//! Client Connection
//!
//! TCP connection speaking the line protocol.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::daemon::protocol::{
    read_bounded_line, LineRead, Status, COMMENT_PREFIX, DEFAULT_MAX_LINE_BYTES,
};

use super::{ClientError, Reply};

/// Client connection to a lindex server
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    banner: Option<String>,
    /// Longest response line accepted
    max_line_bytes: usize,
}

impl Client {
    /// Connect and consume the welcome banner
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ClientError::ServerNotRunning
            } else {
                ClientError::ConnectionFailed(e.to_string())
            }
        })?;
        stream.set_nodelay(true).ok();

        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
            banner: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        };

        let first = client.read_line().await?;
        if first.starts_with(COMMENT_PREFIX) {
            client.banner = Some(first);
        } else {
            return Err(ClientError::UnexpectedResponse(first));
        }

        debug!("Connected to server");
        Ok(client)
    }

    /// Connect, giving up after `timeout`
    pub async fn connect_timeout(
        addr: impl ToSocketAddrs,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        tokio::time::timeout(timeout, Self::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectionFailed(format!("timed out after {:?}", timeout)))?
    }

    /// Welcome line sent by the server
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn set_max_line_bytes(&mut self, max_line_bytes: usize) {
        self.max_line_bytes = max_line_bytes;
    }

    /// Send one command line and collect the response up to its status line
    pub async fn send(&mut self, line: &str) -> Result<Reply, ClientError> {
        if line.contains('\n') {
            return Err(ClientError::RequestFailed(
                "command must be a single line".to_string(),
            ));
        }

        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.writer
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to send request: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to flush: {}", e)))?;

        let mut reply = Reply::default();
        loop {
            let line = self.read_line().await?;
            if let Some(status) = Status::parse(&line) {
                reply.status = status;
                return Ok(reply);
            }
            if let Some(comment) = line.strip_prefix(COMMENT_PREFIX) {
                reply.comments.push(comment.to_string());
            } else {
                reply.lines.push(line);
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, ClientError> {
        let read = read_bounded_line(&mut self.reader, self.max_line_bytes)
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to read response: {}", e)))?;
        let bytes = match read {
            LineRead::Line(bytes) => bytes,
            LineRead::TooLong => {
                return Err(ClientError::UnexpectedResponse(format!(
                    "response line exceeds {} bytes",
                    self.max_line_bytes
                )))
            }
            LineRead::Eof => return Err(ClientError::Closed),
        };
        let mut line = String::from_utf8(bytes).map_err(|_| {
            ClientError::UnexpectedResponse("response is not valid UTF-8".to_string())
        })?;
        while line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}
