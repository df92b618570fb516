//! Readiness of the X11 socket for the async loop
//!
//! x11rb reads from the socket itself, so only readiness is needed here. A
//! poll thread blocks in `mio` on the connection fd and a shutdown waker, and
//! turns readability into a `Notify` permit the loop awaits.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use anyhow::{Context, Result};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::error::CompositorError;

const READABLE: Token = Token(0);
const SHUTDOWN: Token = Token(1);

pub struct X11EventStream {
    conn: Arc<RustConnection>,
    readable: Arc<Notify>,
    waker: Waker,
    poller: Option<JoinHandle<()>>,
}

impl X11EventStream {
    pub fn new(conn: Arc<RustConnection>) -> Result<Self> {
        let fd = conn.stream().as_raw_fd();
        let poll = Poll::new().context("Failed to create X11 poller")?;
        poll.registry()
            .register(&mut SourceFd(&fd), READABLE, Interest::READABLE)
            .context("Failed to register X11 socket")?;
        let waker = Waker::new(poll.registry(), SHUTDOWN).context("Failed to create poller waker")?;

        let readable = Arc::new(Notify::new());
        let notify = readable.clone();
        let poller = std::thread::Builder::new()
            .name("scrim-x11-poll".into())
            .spawn(move || watch(poll, &notify))
            .context("Failed to spawn X11 poll thread")?;

        Ok(Self {
            conn,
            readable,
            waker,
            poller: Some(poller),
        })
    }

    /// Next already-received event, or `None` once the buffer is empty
    ///
    /// A broken connection surfaces as `ServerUnresponsive`.
    pub fn poll_next_event(&self) -> Result<Option<Event>, CompositorError> {
        Ok(self.conn.poll_for_event()?)
    }

    /// Wait until the socket has become readable since the last wait
    pub async fn wait_readable(&self) {
        self.readable.notified().await;
    }

    pub fn flush(&self) -> Result<(), CompositorError> {
        self.conn.flush()?;
        Ok(())
    }
}

impl Drop for X11EventStream {
    fn drop(&mut self) {
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake X11 poll thread: {}", e);
            return;
        }
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                error!("X11 poll thread panicked");
            }
        }
    }
}

/// Poll thread body; mio is edge-triggered, the loop drains fully on each wake
fn watch(mut poll: Poll, readable: &Notify) {
    let mut events = Events::with_capacity(4);
    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // The loop's fallback tick still drains the connection
                error!("X11 socket poll failed, stopping readiness thread: {}", e);
                return;
            }
        }

        for event in events.iter() {
            match event.token() {
                READABLE => readable.notify_one(),
                SHUTDOWN => {
                    debug!("X11 poll thread shutting down");
                    return;
                }
                _ => {}
            }
        }
    }
}
