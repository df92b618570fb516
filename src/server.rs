//! X11 side of the window registry
//!
//! Attribute queries, per-window redirection into named pixmaps, and Damage
//! objects, all over the shared `RustConnection`.

use std::sync::Arc;
use tracing::{trace, warn};
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::composite::{ConnectionExt as CompositeExt, Redirect};
use x11rb::protocol::damage::{ConnectionExt as DamageExt, ReportLevel};
use x11rb::protocol::xproto::{self, ConnectionExt as XprotoExt};
use x11rb::rust_connection::RustConnection;

use crate::error::CompositorError;
use crate::registry::{
    Geometry, MapState, RedirectedBuffer, WindowAttributes, WindowClass, WindowId, WindowSource,
};

/// Outer geometry of a window, border included (what a named pixmap covers)
pub fn outer_geometry(x: i16, y: i16, width: u16, height: u16, border_width: u16) -> Geometry {
    Geometry {
        x: x as i32,
        y: y as i32,
        width: width as u32 + 2 * border_width as u32,
        height: height as u32 + 2 * border_width as u32,
    }
}

impl From<xproto::MapState> for MapState {
    fn from(state: xproto::MapState) -> Self {
        match state {
            xproto::MapState::VIEWABLE => MapState::Mapped,
            xproto::MapState::UNVIEWABLE => MapState::Unviewable,
            _ => MapState::Unmapped,
        }
    }
}

impl From<xproto::WindowClass> for WindowClass {
    fn from(class: xproto::WindowClass) -> Self {
        match class {
            xproto::WindowClass::INPUT_ONLY => WindowClass::InputOnly,
            _ => WindowClass::InputOutput,
        }
    }
}

/// `WindowSource` backed by a live X connection
pub struct X11Source {
    conn: Arc<RustConnection>,
}

impl X11Source {
    pub fn new(conn: Arc<RustConnection>) -> Self {
        Self { conn }
    }

    fn redirect_failed(window: WindowId, err: ReplyError) -> CompositorError {
        match err {
            ReplyError::X11Error(e) => CompositorError::RedirectionFailed {
                window,
                reason: format!("{:?}", e.error_kind),
            },
            ReplyError::ConnectionError(e) => e.into(),
        }
    }
}

impl WindowSource for X11Source {
    fn attributes(&self, window: WindowId) -> Result<WindowAttributes, CompositorError> {
        let conn = self.conn.as_ref();
        // Pipeline both requests before waiting on either
        let attrs_cookie = conn.get_window_attributes(window)?;
        let geom_cookie = conn.get_geometry(window)?;

        let attrs = attrs_cookie
            .reply()
            .map_err(|e| CompositorError::for_window(window, e))?;
        let geom = geom_cookie
            .reply()
            .map_err(|e| CompositorError::for_window(window, e))?;

        Ok(WindowAttributes {
            geometry: outer_geometry(geom.x, geom.y, geom.width, geom.height, geom.border_width),
            map_state: attrs.map_state.into(),
            class: attrs.class.into(),
            depth: geom.depth,
        })
    }

    fn redirect(&self, window: WindowId, depth: u8) -> Result<RedirectedBuffer, CompositorError> {
        let conn = self.conn.as_ref();

        conn.composite_redirect_window(window, Redirect::MANUAL)?
            .check()
            .map_err(|e| Self::redirect_failed(window, e))?;

        let pixmap = conn.generate_id()?;
        if let Err(e) = conn
            .composite_name_window_pixmap(window, pixmap)?
            .check()
        {
            let _ = conn.composite_unredirect_window(window, Redirect::MANUAL);
            return Err(Self::redirect_failed(window, e));
        }

        let damage = match conn.generate_id() {
            Ok(id) => match conn.damage_create(id, window, ReportLevel::NON_EMPTY)?.check() {
                Ok(()) => Some(id),
                Err(ReplyError::ConnectionError(e)) => return Err(e.into()),
                Err(e) => {
                    warn!("damage_create failed for window 0x{:x}: {}", window, e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to generate damage ID for window 0x{:x}: {}", window, e);
                None
            }
        };

        trace!(
            "Named pixmap 0x{:x} (depth {}) for window 0x{:x}, damage {:?}",
            pixmap, depth, window, damage
        );
        Ok(RedirectedBuffer { pixmap, depth, damage })
    }

    fn rename(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<RedirectedBuffer, CompositorError> {
        let conn = self.conn.as_ref();
        conn.free_pixmap(buffer.pixmap)?;

        let pixmap = conn.generate_id()?;
        if let Err(e) = conn
            .composite_name_window_pixmap(window, pixmap)?
            .check()
        {
            if let Some(damage) = buffer.damage {
                let _ = conn.damage_destroy(damage);
            }
            let _ = conn.composite_unredirect_window(window, Redirect::MANUAL);
            return Err(Self::redirect_failed(window, e));
        }

        trace!("Renamed window 0x{:x}: pixmap 0x{:x} -> 0x{:x}", window, buffer.pixmap, pixmap);
        Ok(RedirectedBuffer { pixmap, ..buffer })
    }

    fn release(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<(), CompositorError> {
        let conn = self.conn.as_ref();
        // Unchecked: the window may already be gone, errors arrive as events
        if let Some(damage) = buffer.damage {
            conn.damage_destroy(damage)?;
        }
        conn.free_pixmap(buffer.pixmap)?;
        conn.composite_unredirect_window(window, Redirect::MANUAL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outer_geometry_includes_border() {
        let geom = outer_geometry(-4, 10, 640, 480, 2);
        assert_eq!(geom, Geometry::new(-4, 10, 644, 484));
    }

    #[test]
    fn test_map_state_conversion() {
        assert_eq!(MapState::from(xproto::MapState::VIEWABLE), MapState::Mapped);
        assert_eq!(MapState::from(xproto::MapState::UNVIEWABLE), MapState::Unviewable);
        assert_eq!(MapState::from(xproto::MapState::UNMAPPED), MapState::Unmapped);
        assert_eq!(WindowClass::from(xproto::WindowClass::INPUT_ONLY), WindowClass::InputOnly);
        assert_eq!(WindowClass::from(xproto::WindowClass::INPUT_OUTPUT), WindowClass::InputOutput);
    }
}
