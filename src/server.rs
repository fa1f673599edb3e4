//! Accept loop for the `serve` command: one playback session per consumer.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use tracing::{info, warn};

use crate::session::{SessionId, SessionManager};
use crate::wire::{TcpSink, wait_for_hangup};

pub struct Server {
    listener: TcpListener,
    sessions: SessionManager,
}

impl Server {
    pub fn bind(addr: SocketAddr, sessions: SessionManager) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, sessions })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Start a session for an accepted consumer. A monitor thread tears the
    /// session down as soon as the consumer disconnects.
    pub fn attach(&self, stream: TcpStream) -> io::Result<SessionId> {
        let peer = stream.peer_addr().ok();
        let monitor = stream.try_clone()?;
        let id = self.sessions.open(TcpSink::new(stream))?;
        info!(session = %id, ?peer, "consumer attached");

        let sessions = self.sessions.clone();
        thread::Builder::new().name(format!("hangup-{}", id.get())).spawn(move || {
            wait_for_hangup(monitor);
            // no-op when the session already ended and shut the socket itself
            if sessions.close(id).is_some() {
                info!(session = %id, ?peer, "consumer disconnected");
            }
        })?;
        Ok(id)
    }

    /// Accept consumers until the listener fails.
    pub fn run(&self) -> io::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "serving recording");
        for conn in self.listener.incoming() {
            match conn {
                Ok(stream) => {
                    if let Err(e) = self.attach(stream) {
                        warn!(error = %e, "failed to start session");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(error = %e, "consumer dropped before accept completed");
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
