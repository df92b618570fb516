//! Protocol Extension Gateway
//!
//! Negotiates Composite, XFixes/Shape and Damage before anything else talks to
//! the server, and claims the `_NET_WM_CM_S<n>` selection so other compositing
//! managers can see this one.

use tracing::{debug, info};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::composite::{self, ConnectionExt as CompositeExt};
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::shape::{self, ConnectionExt as ShapeExt};
use x11rb::protocol::xfixes::{self, ConnectionExt as XfixesExt};
use x11rb::protocol::xproto::{ConnectionExt as XprotoExt, CreateWindowAux, WindowClass};
use x11rb::rust_connection::RustConnection;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, CURRENT_TIME, NONE};

use crate::error::CompositorError;

/// Negotiated extension versions, as (major, minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionHandles {
    pub composite: (u32, u32),
    pub xfixes: (u32, u32),
    pub shape: (u16, u16),
    pub damage: (u32, u32),
}

/// Composite 0.3 introduced the overlay window
const COMPOSITE_MIN: (u32, u32) = (0, 3);
/// Region objects and SetWindowShapeRegion need XFixes 2.0
const XFIXES_MIN: (u32, u32) = (2, 0);
const SHAPE_MIN: (u32, u32) = (1, 1);
const DAMAGE_MIN: (u32, u32) = (1, 1);

fn require_version(
    name: &'static str,
    got: (u32, u32),
    min: (u32, u32),
) -> Result<(u32, u32), CompositorError> {
    if got < min {
        return Err(CompositorError::ExtensionUnavailable {
            name,
            reason: format!(
                "server has {}.{}, need at least {}.{}",
                got.0, got.1, min.0, min.1
            ),
        });
    }
    Ok(got)
}

fn require_present(conn: &RustConnection, name: &'static str) -> Result<(), CompositorError> {
    match conn.extension_information(name)? {
        Some(info) => {
            debug!("{} extension present (major opcode {})", name, info.major_opcode);
            Ok(())
        }
        None => Err(CompositorError::ExtensionUnavailable {
            name,
            reason: "not supported by the server".into(),
        }),
    }
}

fn handshake_failed(name: &'static str, err: impl std::fmt::Display) -> CompositorError {
    CompositorError::ExtensionUnavailable {
        name,
        reason: format!("version handshake failed: {}", err),
    }
}

/// Query and enable every extension the compositor relies on
///
/// Order matters: Composite first, then the region/shape pair, then Damage.
/// Any missing extension is fatal.
pub fn initialize(conn: &RustConnection) -> Result<ExtensionHandles, CompositorError> {
    require_present(conn, composite::X11_EXTENSION_NAME)?;
    let reply = conn
        .composite_query_version(0, 4)?
        .reply()
        .map_err(|e| handshake_failed(composite::X11_EXTENSION_NAME, e))?;
    let composite = require_version(
        composite::X11_EXTENSION_NAME,
        (reply.major_version, reply.minor_version),
        COMPOSITE_MIN,
    )?;

    require_present(conn, xfixes::X11_EXTENSION_NAME)?;
    let reply = conn
        .xfixes_query_version(5, 0)?
        .reply()
        .map_err(|e| handshake_failed(xfixes::X11_EXTENSION_NAME, e))?;
    let xfixes = require_version(
        xfixes::X11_EXTENSION_NAME,
        (reply.major_version, reply.minor_version),
        XFIXES_MIN,
    )?;

    require_present(conn, shape::X11_EXTENSION_NAME)?;
    let reply = conn
        .shape_query_version()?
        .reply()
        .map_err(|e| handshake_failed(shape::X11_EXTENSION_NAME, e))?;
    require_version(
        shape::X11_EXTENSION_NAME,
        (reply.major_version as u32, reply.minor_version as u32),
        SHAPE_MIN,
    )?;
    let shape = (reply.major_version, reply.minor_version);

    require_present(conn, damage::X11_EXTENSION_NAME)?;
    let reply = conn
        .damage_query_version(1, 1)?
        .reply()
        .map_err(|e| handshake_failed(damage::X11_EXTENSION_NAME, e))?;
    let damage = require_version(
        damage::X11_EXTENSION_NAME,
        (reply.major_version, reply.minor_version),
        DAMAGE_MIN,
    )?;

    let handles = ExtensionHandles { composite, xfixes, shape, damage };
    info!(
        "Extensions: Composite {}.{}, XFixes {}.{}, Shape {}.{}, Damage {}.{}",
        composite.0, composite.1, xfixes.0, xfixes.1, shape.0, shape.1, damage.0, damage.1
    );
    Ok(handles)
}

/// Ownership of the `_NET_WM_CM_S<screen>` selection
pub struct CompositorSelection {
    owner: u32,
}

impl CompositorSelection {
    pub fn acquire(
        conn: &RustConnection,
        screen_num: usize,
        root: u32,
    ) -> Result<Self, CompositorError> {
        let name = format!("_NET_WM_CM_S{}", screen_num);
        let atom = conn.intern_atom(false, name.as_bytes())?.reply()?.atom;

        let current = conn.get_selection_owner(atom)?.reply()?.owner;
        if current != NONE {
            return Err(CompositorError::CompositorAlreadyRunning { screen: screen_num });
        }

        let owner = conn.generate_id()?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            owner,
            root,
            -1,
            -1,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )?;
        conn.set_selection_owner(owner, atom, CURRENT_TIME)?;

        let after = conn.get_selection_owner(atom)?.reply()?.owner;
        if after != owner {
            let _ = conn.destroy_window(owner);
            return Err(CompositorError::CompositorAlreadyRunning { screen: screen_num });
        }

        info!("Acquired {} (owner window 0x{:x})", name, owner);
        Ok(Self { owner })
    }

    /// Owner window, which the registry must never track
    pub fn window(&self) -> u32 {
        self.owner
    }

    pub fn release(self, conn: &RustConnection) -> Result<(), CompositorError> {
        // Destroying the owner drops the selection
        conn.destroy_window(self.owner)?;
        conn.flush()?;
        Ok(())
    }
}
