//! TCP Server
//!
//! Accepts line-protocol clients and runs one task per connection. Each
//! connection owns its [`Session`]; everything else is shared through the
//! [`RequestHandler`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use super::handler::{RequestHandler, Session};
use super::protocol::{read_bounded_line, welcome_banner, LineRead, Response, Status};

/// Lifecycle of a single client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the next request line
    Connected,
    Parsing,
    Executing,
    /// QUIT received or server shutting down
    Closing,
    Closed,
}

/// Line-protocol server bound to a TCP address
pub struct Server {
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    max_line_bytes: usize,
}

impl Server {
    /// Bind the listening socket
    pub async fn bind(
        addr: &str,
        handler: Arc<RequestHandler>,
        max_line_bytes: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        Ok(Self {
            listener,
            handler,
            max_line_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("New client connection from {}", peer);
                            let connection = Connection {
                                peer,
                                handler: self.handler.clone(),
                                max_line_bytes: self.max_line_bytes,
                                state: ConnectionState::Connected,
                            };
                            let shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                if let Err(e) = connection.serve(stream, shutdown).await {
                                    warn!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

struct Connection {
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    max_line_bytes: usize,
    state: ConnectionState,
}

impl Connection {
    fn transition(&mut self, state: ConnectionState) {
        trace!("{}: {:?} -> {:?}", self.peer, self.state, state);
        self.state = state;
    }

    async fn serve(
        mut self,
        stream: TcpStream,
        mut shutdown: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut session = Session::new();

        writer
            .write_all(format!("{}\n", welcome_banner()).as_bytes())
            .await?;

        loop {
            let read = tokio::select! {
                read = read_bounded_line(&mut reader, self.max_line_bytes) => read?,
                _ = shutdown.recv() => {
                    self.transition(ConnectionState::Closing);
                    writer.write_all(Response::bye().encode().as_bytes()).await?;
                    break;
                }
            };

            self.transition(ConnectionState::Parsing);
            let bytes = match read {
                LineRead::Line(bytes) => bytes,
                LineRead::TooLong => {
                    warn!("{}: request line exceeds {} bytes", self.peer, self.max_line_bytes);
                    let response = Response::error(
                        400,
                        format!("Request line exceeds {} bytes", self.max_line_bytes),
                    );
                    writer.write_all(response.encode().as_bytes()).await?;
                    self.transition(ConnectionState::Connected);
                    continue;
                }
                LineRead::Eof => {
                    debug!("Client {} disconnected", self.peer);
                    break;
                }
            };

            let line = match String::from_utf8(bytes) {
                Ok(line) => line,
                Err(_) => {
                    let response = Response::error(400, "Request is not valid UTF-8");
                    writer.write_all(response.encode().as_bytes()).await?;
                    self.transition(ConnectionState::Connected);
                    continue;
                }
            };

            self.transition(ConnectionState::Executing);
            let line = line.trim_end_matches('\r');
            let Some(response) = self.handler.handle_line(&mut session, line).await else {
                self.transition(ConnectionState::Connected);
                continue;
            };

            writer.write_all(response.encode().as_bytes()).await?;
            if matches!(response.status, Status::Bye) {
                self.transition(ConnectionState::Closing);
                break;
            }
            self.transition(ConnectionState::Connected);
        }

        session.release();
        writer.flush().await?;
        let _ = writer.shutdown().await;
        self.transition(ConnectionState::Closed);
        Ok(())
    }
}
