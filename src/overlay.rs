//! Overlay Surface Manager
//!
//! Owns the Composite Overlay Window (COW): the one full-screen surface the
//! composited frame is presented on. Its input region is empty so every click
//! and key falls through to the real windows underneath.

use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::protocol::composite::ConnectionExt as CompositeExt;
use x11rb::protocol::shape::{ConnectionExt as ShapeExt, SK};
use x11rb::protocol::xfixes::{ConnectionExt as XfixesExt, Region};
use x11rb::protocol::xproto::ConnectionExt as XprotoExt;
use x11rb::rust_connection::RustConnection;
use x11rb::NONE;

use crate::error::CompositorError;

/// The overlay window and its input pass-through region
#[derive(Debug)]
pub struct OverlaySurface {
    pub window: u32,
    root: u32,
    input_region: Region,
    width: u16,
    height: u16,
}

fn overlay_failed(err: impl std::fmt::Display) -> CompositorError {
    CompositorError::OverlayCreationFailed(err.to_string())
}

impl OverlaySurface {
    /// Request the overlay for `root` and make it input-transparent
    pub fn create(conn: &RustConnection, root: u32) -> Result<Self, CompositorError> {
        let window = conn
            .composite_get_overlay_window(root)?
            .reply()
            .map_err(overlay_failed)?
            .overlay_win;
        if window == NONE {
            return Err(overlay_failed("server returned no overlay window"));
        }
        info!("Using Composite Overlay Window: 0x{:x}", window);

        // Empty region: the overlay accepts no input anywhere
        let input_region = conn.generate_id().map_err(overlay_failed)?;
        conn.xfixes_create_region(input_region, &[])?
            .check()
            .map_err(overlay_failed)?;

        // Bounding stays at the server default (whole screen)
        conn.xfixes_set_window_shape_region(window, SK::BOUNDING, 0, 0, NONE)?;
        conn.xfixes_set_window_shape_region(window, SK::INPUT, 0, 0, input_region)?
            .check()
            .map_err(overlay_failed)?;

        // Observe later shape/geometry changes (display resize)
        conn.shape_select_input(window, true)?;

        let geom = conn
            .get_geometry(window)?
            .reply()
            .map_err(overlay_failed)?;
        conn.flush()?;

        debug!("Overlay 0x{:x} is {}x{}", window, geom.width, geom.height);
        Ok(Self {
            window,
            root,
            input_region,
            width: geom.width,
            height: geom.height,
        })
    }

    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// Record new dimensions; returns whether they differ from the old ones
    pub fn set_size(&mut self, width: u16, height: u16) -> bool {
        if (width, height) == (self.width, self.height) || width == 0 || height == 0 {
            return false;
        }
        info!(
            "Overlay resized {}x{} -> {}x{}",
            self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        true
    }

    /// Re-query the overlay's geometry from the server
    pub fn refresh_size(&mut self, conn: &RustConnection) -> Result<bool, CompositorError> {
        let geom = conn.get_geometry(self.window)?.reply()?;
        Ok(self.set_size(geom.width, geom.height))
    }

    /// Release the pass-through region and hand the overlay back
    pub fn destroy(self, conn: &RustConnection) -> Result<(), CompositorError> {
        conn.xfixes_destroy_region(self.input_region)?;
        conn.composite_release_overlay_window(self.root)?;
        conn.flush()?;
        info!("Released overlay window 0x{:x}", self.window);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> OverlaySurface {
        OverlaySurface {
            window: 0x400001,
            root: 0x1e1,
            input_region: 0x400002,
            width: 1920,
            height: 1080,
        }
    }

    #[test]
    fn test_set_size_reports_changes_only() {
        let mut overlay = surface();
        assert!(!overlay.set_size(1920, 1080));
        assert!(overlay.set_size(2560, 1440));
        assert_eq!(overlay.size(), (2560, 1440));
    }

    #[test]
    fn test_set_size_ignores_degenerate_sizes() {
        let mut overlay = surface();
        assert!(!overlay.set_size(0, 1440));
        assert_eq!(overlay.size(), (1920, 1080));
    }
}
