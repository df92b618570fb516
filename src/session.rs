//! Session lifecycle and event loop
//!
//! Drives `Disconnected -> Initializing -> Running -> ShuttingDown`. The loop
//! task owns the registry; the render thread only ever sees snapshots.

use bitflags::bitflags;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::damage::ConnectionExt as DamageExt;
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, ConnectionExt as XprotoExt, EventMask, Place,
};
use x11rb::rust_connection::RustConnection;
use x11rb::NONE;

use crate::config::Config;
use crate::error::CompositorError;
use crate::extensions::{self, CompositorSelection};
use crate::overlay::OverlaySurface;
use crate::registry::{Registry, StackPosition, WindowId, WindowSource};
use crate::render::{RenderPipeline, RenderSettings};
use crate::server::{X11Source, outer_geometry};
use crate::x11_async::X11EventStream;

/// Lifecycle of one compositing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Initializing,
    Running,
    ShuttingDown,
}

/// Inputs that move the session between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    TreeCaptured,
    Fatal,
    Terminate,
}

impl SessionState {
    /// Next state, or `None` if `transition` is not valid from `self`
    pub fn next(self, transition: Transition) -> Option<SessionState> {
        use SessionState::*;
        use Transition::*;
        match (self, transition) {
            (Disconnected, Start) => Some(Initializing),
            (Initializing, TreeCaptured) => Some(Running),
            (Initializing, Fatal) | (Initializing, Terminate) => Some(ShuttingDown),
            (Running, Fatal) | (Running, Terminate) => Some(ShuttingDown),
            _ => None,
        }
    }

    fn advance(&mut self, transition: Transition) {
        match self.next(transition) {
            Some(next) => {
                info!("Session {:?} -> {:?}", self, next);
                *self = next;
            }
            None => debug!("Ignoring {:?} in state {:?}", transition, self),
        }
    }
}

bitflags! {
    /// Work an event batch leaves for the loop
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dirty: u8 {
        const FRAME  = 1 << 0;
        const RESIZE = 1 << 1;
    }
}

/// Startup options from the command line
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config_path: Option<PathBuf>,
    pub display: Option<String>,
}

/// Holds the server grabbed until dropped
///
/// Other clients are stalled while this lives, so keep it around a single
/// bulk query.
struct ServerGrab<'a> {
    conn: &'a RustConnection,
}

impl<'a> ServerGrab<'a> {
    fn new(conn: &'a RustConnection) -> Result<Self, CompositorError> {
        conn.grab_server()?;
        Ok(Self { conn })
    }
}

impl Drop for ServerGrab<'_> {
    fn drop(&mut self) {
        let _ = self.conn.ungrab_server();
        let _ = self.conn.flush();
    }
}

/// Root children bottom to top, enumerated atomically
fn enumerate_tree(conn: &RustConnection, root: WindowId) -> Result<Vec<WindowId>, CompositorError> {
    let _grab = ServerGrab::new(conn)?;
    let tree = conn.query_tree(root)?.reply()?;
    Ok(tree.children)
}

/// Keep going on per-window errors, stop on anything else
fn escalate(result: Result<(), CompositorError>) -> Result<(), CompositorError> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            trace!("Ignoring per-window error: {}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

struct Session {
    conn: Arc<RustConnection>,
    root: WindowId,
    registry: Registry<X11Source>,
    overlay: OverlaySurface,
    selection: CompositorSelection,
    pipeline: RenderPipeline,
    render_errors: mpsc::UnboundedReceiver<CompositorError>,
    x11_stream: X11EventStream,
    frame_delay: Duration,
    fallback_redraw: Duration,
}

impl Session {
    async fn initialize(display: Option<String>, config: &Config) -> Result<Self, CompositorError> {
        let (conn, screen_num) = x11rb::connect(display.as_deref())
            .map_err(|e| CompositorError::ServerUnresponsive(e.to_string()))?;
        let conn = Arc::new(conn);
        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_else(|| CompositorError::Protocol(format!("screen {} does not exist", screen_num)))?;
        let root = screen.root;
        info!(
            "Connected to X display, screen {} ({}x{})",
            screen_num, screen.width_in_pixels, screen.height_in_pixels
        );

        let handles = extensions::initialize(&conn)?;
        debug!(
            "Damage {}.{} paces frames, Composite {}.{} provides the overlay",
            handles.damage.0, handles.damage.1, handles.composite.0, handles.composite.1
        );
        let selection = CompositorSelection::acquire(&conn, screen_num, root)?;

        // Subscribe before enumerating so no change between the two is lost
        let mask = EventMask::SUBSTRUCTURE_NOTIFY | EventMask::STRUCTURE_NOTIFY;
        if let Err(e) = conn
            .change_window_attributes(root, &ChangeWindowAttributesAux::new().event_mask(mask))?
            .check()
        {
            abandon(&conn, None, selection);
            return Err(e.into());
        }

        let mut registry = Registry::new(X11Source::new(conn.clone()), config.compositor.default_opacity);
        registry.exclude(selection.window())?;
        let bootstrap = enumerate_tree(&conn, root).and_then(|children| registry.populate(&children));
        if let Err(e) = bootstrap {
            abandon(&conn, Some(registry), selection);
            return Err(e);
        }

        let overlay = match OverlaySurface::create(&conn, root) {
            Ok(overlay) => overlay,
            Err(e) => {
                abandon(&conn, Some(registry), selection);
                return Err(e);
            }
        };
        // The overlay sits above every window; stack it so restacks above it resolve
        let stacked = registry
            .exclude(overlay.window)
            .and_then(|()| registry.on_window_created_or_mapped(overlay.window));
        if let Err(e) = stacked {
            let _ = overlay.destroy(&conn);
            abandon(&conn, Some(registry), selection);
            return Err(e);
        }

        let (width, height) = overlay.size();
        let settings = RenderSettings {
            display,
            screen_num,
            overlay: overlay.window,
            width,
            height,
            vsync: config.compositor.vsync,
            background: config.compositor.background,
        };
        let (error_tx, render_errors) = mpsc::unbounded_channel();
        let pipeline = match RenderPipeline::spawn(settings, error_tx).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                let _ = overlay.destroy(&conn);
                abandon(&conn, Some(registry), selection);
                return Err(e);
            }
        };

        let x11_stream = match X11EventStream::new(conn.clone()) {
            Ok(stream) => stream,
            Err(e) => {
                pipeline.shutdown();
                let _ = overlay.destroy(&conn);
                abandon(&conn, Some(registry), selection);
                return Err(CompositorError::ServerUnresponsive(format!("{:#}", e)));
            }
        };

        Ok(Self {
            conn,
            root,
            registry,
            overlay,
            selection,
            pipeline,
            render_errors,
            x11_stream,
            frame_delay: config.compositor.frame_delay(),
            fallback_redraw: config.compositor.fallback_redraw(),
        })
    }

    /// Run until a termination signal (`Ok`) or a fatal error
    async fn run(&mut self) -> Result<(), CompositorError> {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| CompositorError::Protocol(format!("failed to install SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| CompositorError::Protocol(format!("failed to install SIGINT handler: {}", e)))?;

        let mut fallback = tokio::time::interval(self.fallback_redraw);
        fallback.tick().await;

        let mut render_at: Option<Instant> = None;

        let snapshot = self.registry.snapshot();
        info!("Compositing {} windows", snapshot.len());
        self.pipeline.submit(snapshot)?;

        loop {
            // Events may already sit in the connection buffer after replies
            let dirty = self.drain_events()?;
            if dirty.contains(Dirty::RESIZE) {
                let (width, height) = self.overlay.size();
                self.pipeline.resize(width, height)?;
            }
            if !dirty.is_empty() && render_at.is_none() {
                render_at = Some(Instant::now() + self.frame_delay);
            }
            self.x11_stream.flush()?;

            tokio::select! {
                () = self.x11_stream.wait_readable() => {}

                _ = async {
                    match render_at {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                }, if render_at.is_some() => {
                    render_at = None;
                    self.pipeline.submit(self.registry.snapshot())?;
                }

                _ = fallback.tick() => {
                    if render_at.take().is_some() {
                        self.pipeline.submit(self.registry.snapshot())?;
                    }
                }

                Some(e) = self.render_errors.recv() => {
                    return Err(e);
                }

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    return Ok(());
                }

                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn drain_events(&mut self) -> Result<Dirty, CompositorError> {
        let mut dirty = Dirty::empty();
        while let Some(event) = self.x11_stream.poll_next_event()? {
            dirty |= self.handle_event(event)?;
        }
        Ok(dirty)
    }

    fn handle_event(&mut self, event: Event) -> Result<Dirty, CompositorError> {
        let routed = route_event(&mut self.registry, self.root, self.overlay.window, &event)?;
        let dirty = match routed {
            Routed::Ignored => Dirty::empty(),
            Routed::Changed => Dirty::FRAME,
            Routed::RootResized { width, height } => {
                if self.overlay.set_size(width, height) {
                    Dirty::FRAME | Dirty::RESIZE
                } else {
                    Dirty::empty()
                }
            }
            Routed::Damage(damage) => {
                self.conn.damage_subtract(damage, NONE, NONE)?;
                Dirty::FRAME
            }
            Routed::OverlayShape => {
                if self.overlay.refresh_size(&self.conn)? {
                    Dirty::FRAME | Dirty::RESIZE
                } else {
                    Dirty::empty()
                }
            }
        };
        Ok(dirty)
    }

    /// Tear down in reverse dependency order: GPU, overlay, registry, selection
    fn shutdown(self) {
        let Session { conn, mut registry, overlay, selection, pipeline, x11_stream, .. } = self;
        drop(x11_stream);
        pipeline.shutdown();
        if let Err(e) = overlay.destroy(&conn) {
            warn!("Failed to release overlay: {}", e);
        }
        if let Err(e) = registry.teardown() {
            warn!("Failed to release window buffers: {}", e);
        }
        if let Err(e) = selection.release(&conn) {
            warn!("Failed to release compositor selection: {}", e);
        }
    }
}

/// What an event asks of the loop once the registry has seen it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routed {
    Ignored,
    Changed,
    RootResized { width: u16, height: u16 },
    /// Contents changed; the region must be subtracted
    Damage(u32),
    OverlayShape,
}

/// Apply one event to the registry
///
/// Only root children are tracked; everything touching the server beyond
/// the registry's own source is left to the caller.
fn route_event<S: WindowSource>(
    registry: &mut Registry<S>,
    root: WindowId,
    overlay: WindowId,
    event: &Event,
) -> Result<Routed, CompositorError> {
    match event {
        Event::CreateNotify(e) if e.parent == root && !registry.find_window(e.window) => {
            escalate(registry.on_window_created_or_mapped(e.window))?;
        }
        Event::MapNotify(e) if e.event == root => {
            escalate(registry.on_mapped(e.window))?;
        }
        Event::UnmapNotify(e) if e.event == root => {
            escalate(registry.on_destroyed_or_unmapped(e.window))?;
        }
        Event::DestroyNotify(e) if e.event == root => {
            escalate(registry.on_destroyed(e.window))?;
        }
        Event::ConfigureNotify(e) if e.window == root => {
            return Ok(Routed::RootResized { width: e.width, height: e.height });
        }
        Event::ConfigureNotify(e) if e.event == root => {
            let geometry = outer_geometry(e.x, e.y, e.width, e.height, e.border_width);
            let position = if e.above_sibling == NONE {
                StackPosition::Bottom
            } else {
                StackPosition::Above(e.above_sibling)
            };
            escalate(registry.on_configure_or_restack(e.window, geometry, Some(position)))?;
        }
        Event::CirculateNotify(e) if e.event == root => {
            let position = if e.place == Place::ON_TOP {
                StackPosition::Top
            } else {
                StackPosition::Bottom
            };
            registry.on_restacked(e.window, position);
        }
        Event::ReparentNotify(e) if e.event == root => {
            if e.parent == root {
                escalate(registry.on_window_created_or_mapped(e.window))?;
            } else {
                escalate(registry.on_destroyed(e.window))?;
            }
        }
        Event::DamageNotify(e) => return Ok(Routed::Damage(e.damage)),
        Event::ShapeNotify(e) if e.affected_window == overlay => return Ok(Routed::OverlayShape),
        Event::Error(e) => {
            // Requests racing a window's destruction fail asynchronously
            debug!(
                "X11 error {:?} (resource 0x{:x}, request {:?})",
                e.error_kind, e.bad_value, e.request_name
            );
            return Ok(Routed::Ignored);
        }
        other => {
            trace!("Unhandled event: {:?}", other);
            return Ok(Routed::Ignored);
        }
    }
    Ok(Routed::Changed)
}

/// Undo a partially completed startup
fn abandon(conn: &RustConnection, registry: Option<Registry<X11Source>>, selection: CompositorSelection) {
    if let Some(mut registry) = registry {
        let _ = registry.teardown();
    }
    let _ = selection.release(conn);
}

/// Run one compositing session; returns the process exit code
pub async fn run(options: Options) -> i32 {
    let config = match &options.config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return 1;
        }
    };
    config.warn_unsupported();

    let display = options.display.or_else(|| config.display.clone());
    let mut state = SessionState::Disconnected;
    state.advance(Transition::Start);

    let mut session = match Session::initialize(display, &config).await {
        Ok(session) => session,
        Err(e) => {
            error!("Startup failed: {}", e);
            state.advance(Transition::Fatal);
            return 1;
        }
    };
    state.advance(Transition::TreeCaptured);

    let result = session.run().await;
    let code = match &result {
        Ok(()) => {
            state.advance(Transition::Terminate);
            0
        }
        Err(e) => {
            error!("Compositor stopped: {}", e);
            state.advance(Transition::Fatal);
            1
        }
    };

    session.shutdown();
    info!("Session ended in state {:?}", state);
    code
}
