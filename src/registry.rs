//! Window Registry
//!
//! Authoritative model of the root window's children: existence, stacking
//! order, geometry, map state and the redirected buffer each one paints from.
//! The render side only ever sees immutable [`Snapshot`]s of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::error::CompositorError;

pub type WindowId = u32;

/// Window geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    fn same_size(&self, other: &Geometry) -> bool {
        self.width == other.width && self.height == other.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    Mapped,
    Unviewable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowClass {
    InputOutput,
    InputOnly,
}

/// Server-side attributes fetched when a window is first seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAttributes {
    /// Outer geometry, border included
    pub geometry: Geometry,
    pub map_state: MapState,
    pub class: WindowClass,
    pub depth: u8,
}

/// Off-screen buffer a redirected window renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectedBuffer {
    pub pixmap: u32,
    pub depth: u8,
    /// Damage object reporting changes to the window, if one could be created
    pub damage: Option<u32>,
}

/// Where a configure notification places a window in the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPosition {
    Bottom,
    Top,
    Above(WindowId),
}

/// One top-level window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRecord {
    pub id: WindowId,
    pub geometry: Geometry,
    /// Dense paint order, 0 paints first (bottom)
    pub stacking_index: usize,
    pub map_state: MapState,
    pub class: WindowClass,
    pub depth: u8,
    pub buffer: Option<RedirectedBuffer>,
    pub opacity: f32,
}

impl WindowRecord {
    /// Whether the render pipeline should draw this window
    pub fn is_paintable(&self) -> bool {
        self.map_state == MapState::Mapped
            && self.class == WindowClass::InputOutput
            && self.buffer.is_some()
            && self.geometry.width > 0
            && self.geometry.height > 0
    }
}

/// Immutable bottom-to-top copy of the registry
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    windows: Arc<[WindowRecord]>,
}

impl Snapshot {
    pub fn windows(&self) -> &[WindowRecord] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn ids(&self) -> Vec<WindowId> {
        self.windows.iter().map(|w| w.id).collect()
    }

    pub fn get(&self, id: WindowId) -> Option<&WindowRecord> {
        self.windows.iter().find(|w| w.id == id)
    }
}

/// Server operations the registry depends on
pub trait WindowSource {
    fn attributes(&self, window: WindowId) -> Result<WindowAttributes, CompositorError>;

    /// Redirect `window` and name a pixmap holding its contents
    fn redirect(&self, window: WindowId, depth: u8) -> Result<RedirectedBuffer, CompositorError>;

    /// Swap the named pixmap for a fresh one after a resize
    ///
    /// Redirection and the Damage object stay in place. On failure the source
    /// has already released everything belonging to `buffer`.
    fn rename(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<RedirectedBuffer, CompositorError>;

    /// Release everything `redirect` handed out
    fn release(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<(), CompositorError>;
}

impl<T: WindowSource + ?Sized> WindowSource for &T {
    fn attributes(&self, window: WindowId) -> Result<WindowAttributes, CompositorError> {
        (**self).attributes(window)
    }

    fn redirect(&self, window: WindowId, depth: u8) -> Result<RedirectedBuffer, CompositorError> {
        (**self).redirect(window, depth)
    }

    fn rename(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<RedirectedBuffer, CompositorError> {
        (**self).rename(window, buffer)
    }

    fn release(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<(), CompositorError> {
        (**self).release(window, buffer)
    }
}

/// Registry of top-level windows
///
/// `stack` mirrors the server's order of every root child, including windows
/// that are never painted (InputOnly, unmapped, excluded), so a restack
/// relative to any sibling lands where the server put it. Records exist only
/// for windows that may be painted.
///
/// Every mutator returns `Err` only for failures that end the session; a
/// vanished window or a failed redirection is absorbed here.
pub struct Registry<S> {
    source: S,
    windows: HashMap<WindowId, WindowRecord>,
    stack: Vec<WindowId>, // bottom to top
    excluded: HashSet<WindowId>,
    opacity: f32,
}

impl<S: WindowSource> Registry<S> {
    pub fn new(source: S, opacity: f32) -> Self {
        Self {
            source,
            windows: HashMap::new(),
            stack: Vec::new(),
            excluded: HashSet::new(),
            opacity,
        }
    }

    /// Never track `window` (the overlay and the compositor's own windows)
    pub fn exclude(&mut self, window: WindowId) -> Result<(), CompositorError> {
        self.excluded.insert(window);
        self.on_destroyed_or_unmapped(window)
    }

    /// Populate from a bottom-to-top list of root children
    pub fn populate(&mut self, children: &[WindowId]) -> Result<(), CompositorError> {
        for &window in children {
            self.push_stacked(window);
        }
        for &window in children {
            self.on_window_created_or_mapped(window)?;
        }
        info!("Registry populated: {} of {} windows tracked", self.windows.len(), children.len());
        Ok(())
    }

    pub fn find_window(&self, window: WindowId) -> bool {
        self.windows.contains_key(&window)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Copy the current state, bottom to top
    pub fn snapshot(&self) -> Snapshot {
        let windows: Vec<WindowRecord> = self
            .stack
            .iter()
            .filter_map(|id| self.windows.get(id))
            .enumerate()
            .map(|(index, w)| WindowRecord {
                stacking_index: index,
                ..w.clone()
            })
            .collect();
        Snapshot { windows: windows.into() }
    }

    /// A new root child appears on top unless it is already known
    fn push_stacked(&mut self, window: WindowId) {
        if !self.stack.contains(&window) {
            self.stack.push(window);
        }
    }

    pub fn on_window_created_or_mapped(&mut self, window: WindowId) -> Result<(), CompositorError> {
        if self.excluded.contains(&window) {
            self.push_stacked(window);
            return Ok(());
        }
        if self.windows.contains_key(&window) {
            return Ok(());
        }

        let attrs = match self.source.attributes(window) {
            Ok(attrs) => attrs,
            Err(e) if e.is_fatal() => return Err(e),
            Err(_) => {
                trace!("Window 0x{:x} vanished before it could be tracked", window);
                return Ok(());
            }
        };
        self.push_stacked(window);

        if attrs.class == WindowClass::InputOnly || attrs.map_state == MapState::Unviewable {
            trace!("Ignoring window 0x{:x} ({:?}, {:?})", window, attrs.class, attrs.map_state);
            return Ok(());
        }

        self.windows.insert(
            window,
            WindowRecord {
                id: window,
                geometry: attrs.geometry,
                stacking_index: 0,
                map_state: attrs.map_state,
                class: attrs.class,
                depth: attrs.depth,
                buffer: None,
                opacity: self.opacity,
            },
        );
        debug!(
            "Tracking window 0x{:x} at {:?} ({:?})",
            window, attrs.geometry, attrs.map_state
        );

        if attrs.map_state == MapState::Mapped {
            self.redirect(window)?;
        }
        Ok(())
    }

    /// A window became viewable
    ///
    /// Promotes a tracked, unmapped window and redirects it; an unknown window
    /// takes the creation path.
    pub fn on_mapped(&mut self, window: WindowId) -> Result<(), CompositorError> {
        match self.windows.get_mut(&window) {
            Some(record) if record.map_state != MapState::Mapped => {
                record.map_state = MapState::Mapped;
                self.redirect(window)
            }
            Some(_) => Ok(()),
            None => self.on_window_created_or_mapped(window),
        }
    }

    /// Geometry and stacking change for any root child
    ///
    /// Untracked windows still move in the stack; only tracked ones carry
    /// geometry.
    pub fn on_configure_or_restack(
        &mut self,
        window: WindowId,
        geometry: Geometry,
        position: Option<StackPosition>,
    ) -> Result<(), CompositorError> {
        if let Some(position) = position {
            self.restack(window, position);
        }

        let Some(record) = self.windows.get_mut(&window) else {
            return Ok(());
        };
        let resized = !record.geometry.same_size(&geometry);
        record.geometry = geometry;

        if resized && record.map_state == MapState::Mapped {
            // The old pixmap keeps the old size
            self.rename(window)?;
        }
        Ok(())
    }

    /// Stacking change without new geometry (circulate requests)
    pub fn on_restacked(&mut self, window: WindowId, position: StackPosition) {
        self.restack(window, position);
    }

    /// Remove the record and release its buffer
    ///
    /// The window keeps its stacking slot so a later map reappears there.
    pub fn on_destroyed_or_unmapped(&mut self, window: WindowId) -> Result<(), CompositorError> {
        let Some(record) = self.windows.remove(&window) else {
            return Ok(());
        };
        debug!("Untracked window 0x{:x}", window);

        if let Some(buffer) = record.buffer {
            self.release_buffer(window, buffer)?;
        }
        Ok(())
    }

    /// The window left the root's children: destroyed or reparented away
    pub fn on_destroyed(&mut self, window: WindowId) -> Result<(), CompositorError> {
        self.stack.retain(|&id| id != window);
        self.on_destroyed_or_unmapped(window)
    }

    /// Drop every record and release all buffers
    pub fn teardown(&mut self) -> Result<(), CompositorError> {
        let ids: Vec<WindowId> = self.stack.drain(..).collect();
        for id in ids {
            if let Some(buffer) = self.windows.remove(&id).and_then(|r| r.buffer) {
                self.release_buffer(id, buffer)?;
            }
        }
        self.windows.clear();
        Ok(())
    }

    fn restack(&mut self, window: WindowId, position: StackPosition) {
        let Some(current) = self.stack.iter().position(|&id| id == window) else {
            return;
        };

        let target = match position {
            StackPosition::Bottom => 0,
            StackPosition::Top => self.stack.len() - 1,
            StackPosition::Above(sibling) if sibling == window => return,
            StackPosition::Above(sibling) => {
                match self.stack.iter().position(|&id| id == sibling) {
                    // Index after removing `window` from its current slot
                    Some(s) if s < current => s + 1,
                    Some(s) => s,
                    None => {
                        trace!(
                            "Restack of 0x{:x} above unknown 0x{:x}, keeping position",
                            window, sibling
                        );
                        return;
                    }
                }
            }
        };

        self.stack.remove(current);
        self.stack.insert(target, window);
    }

    fn redirect(&mut self, window: WindowId) -> Result<(), CompositorError> {
        let Some(record) = self.windows.get_mut(&window) else {
            return Ok(());
        };

        match self.source.redirect(window, record.depth) {
            Ok(buffer) => {
                trace!("Window 0x{:x} redirected into pixmap 0x{:x}", window, buffer.pixmap);
                record.buffer = Some(buffer);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(CompositorError::StaleHandle(_)) => Ok(()),
            Err(e) => {
                warn!("{}; window stays tracked but unpainted", e);
                Ok(())
            }
        }
    }

    fn rename(&mut self, window: WindowId) -> Result<(), CompositorError> {
        let Some(record) = self.windows.get_mut(&window) else {
            return Ok(());
        };
        let Some(buffer) = record.buffer.take() else {
            // Never redirected successfully; try again at the new size
            return self.redirect(window);
        };

        match self.source.rename(window, buffer) {
            Ok(renamed) => {
                trace!("Window 0x{:x} renamed to pixmap 0x{:x}", window, renamed.pixmap);
                record.buffer = Some(renamed);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(CompositorError::StaleHandle(_)) => Ok(()),
            Err(e) => {
                warn!("{}; window stays tracked but unpainted", e);
                Ok(())
            }
        }
    }

    fn release_buffer(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<(), CompositorError> {
        match self.source.release(window, buffer) {
            Err(e) if e.is_fatal() => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// In-memory stand-in for the X server
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub attrs: RefCell<HashMap<WindowId, WindowAttributes>>,
        pub failing: RefCell<HashSet<WindowId>>,
        pub released: RefCell<Vec<RedirectedBuffer>>,
        /// Pixmaps freed by a rename
        pub renamed: RefCell<Vec<u32>>,
        pub dead: Cell<bool>,
        next_pixmap: Cell<u32>,
    }

    impl FakeSource {
        pub(crate) fn add(&self, id: WindowId, geometry: Geometry, map_state: MapState, class: WindowClass) {
            self.attrs.borrow_mut().insert(
                id,
                WindowAttributes { geometry, map_state, class, depth: 24 },
            );
        }

        pub(crate) fn mapped(&self, id: WindowId, geometry: Geometry) {
            self.add(id, geometry, MapState::Mapped, WindowClass::InputOutput);
        }

        fn fresh_pixmap(&self) -> u32 {
            let pixmap = 0x1000 + self.next_pixmap.get();
            self.next_pixmap.set(self.next_pixmap.get() + 1);
            pixmap
        }
    }

    impl WindowSource for FakeSource {
        fn attributes(&self, window: WindowId) -> Result<WindowAttributes, CompositorError> {
            if self.dead.get() {
                return Err(CompositorError::ServerUnresponsive("gone".into()));
            }
            self.attrs
                .borrow()
                .get(&window)
                .copied()
                .ok_or(CompositorError::StaleHandle(window))
        }

        fn redirect(&self, window: WindowId, depth: u8) -> Result<RedirectedBuffer, CompositorError> {
            if self.failing.borrow().contains(&window) {
                return Err(CompositorError::RedirectionFailed {
                    window,
                    reason: "BadMatch".into(),
                });
            }
            let pixmap = self.fresh_pixmap();
            Ok(RedirectedBuffer { pixmap, depth, damage: Some(pixmap + 0x100) })
        }

        fn rename(&self, window: WindowId, buffer: RedirectedBuffer) -> Result<RedirectedBuffer, CompositorError> {
            self.renamed.borrow_mut().push(buffer.pixmap);
            if self.failing.borrow().contains(&window) {
                self.released.borrow_mut().push(buffer);
                return Err(CompositorError::RedirectionFailed {
                    window,
                    reason: "BadMatch".into(),
                });
            }
            Ok(RedirectedBuffer { pixmap: self.fresh_pixmap(), ..buffer })
        }

        fn release(&self, _window: WindowId, buffer: RedirectedBuffer) -> Result<(), CompositorError> {
            self.released.borrow_mut().push(buffer);
            Ok(())
        }
    }

    const OVERLAY: WindowId = 0x99;

    fn geom(x: i32, y: i32) -> Geometry {
        Geometry::new(x, y, 100, 100)
    }

    #[test]
    fn test_duplicate_create_yields_one_record() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        let mut registry = Registry::new(&source, 1.0);

        registry.on_window_created_or_mapped(1).unwrap();
        registry.on_window_created_or_mapped(1).unwrap();

        assert_eq!(registry.snapshot().ids(), vec![1]);
        assert!(registry.find_window(1));
    }

    #[test]
    fn test_create_then_restack_to_top() {
        let source = FakeSource::default();
        source.mapped(0xA, geom(0, 0));
        source.mapped(0xB, geom(50, 50));
        let mut registry = Registry::new(&source, 1.0);

        registry.on_window_created_or_mapped(0xA).unwrap();
        registry.on_window_created_or_mapped(0xB).unwrap();
        assert_eq!(registry.snapshot().ids(), vec![0xA, 0xB]);

        registry
            .on_configure_or_restack(0xA, geom(0, 0), Some(StackPosition::Top))
            .unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.ids(), vec![0xB, 0xA]);
        assert_eq!(snapshot.get(0xA).unwrap().stacking_index, 1);
        assert_eq!(snapshot.get(0xB).unwrap().stacking_index, 0);
    }

    #[test]
    fn test_restack_sequences_keep_indices_dense_and_increasing() {
        let source = FakeSource::default();
        for id in 1..=5 {
            source.mapped(id, geom(0, 0));
        }
        let mut registry = Registry::new(&source, 1.0);
        registry.populate(&[1, 2, 3, 4, 5]).unwrap();

        let moves = [
            (1, StackPosition::Above(4)), // 2 3 4 1 5
            (5, StackPosition::Bottom),   // 5 2 3 4 1
            (3, StackPosition::Above(1)), // 5 2 4 1 3
            (2, StackPosition::Top),      // 5 4 1 3 2
            (4, StackPosition::Above(5)), // unchanged
            (1, StackPosition::Above(1)), // self reference, unchanged
        ];
        for (id, position) in moves {
            registry.on_configure_or_restack(id, geom(0, 0), Some(position)).unwrap();
            let snapshot = registry.snapshot();
            let indices: Vec<usize> = snapshot.windows().iter().map(|w| w.stacking_index).collect();
            assert_eq!(indices, (0..5).collect::<Vec<_>>());
        }
        assert_eq!(registry.snapshot().ids(), vec![5, 4, 1, 3, 2]);
    }

    #[test]
    fn test_overlay_never_tracked() {
        let source = FakeSource::default();
        source.mapped(OVERLAY, geom(0, 0));
        source.mapped(1, geom(0, 0));
        let mut registry = Registry::new(&source, 1.0);
        registry.exclude(OVERLAY).unwrap();

        registry.populate(&[OVERLAY, 1]).unwrap();
        registry.on_window_created_or_mapped(OVERLAY).unwrap();
        registry.on_mapped(OVERLAY).unwrap();
        registry
            .on_configure_or_restack(1, geom(0, 0), Some(StackPosition::Above(OVERLAY)))
            .unwrap();

        assert!(!registry.snapshot().ids().contains(&OVERLAY));
        assert!(!registry.find_window(OVERLAY));
    }

    #[test]
    fn test_input_only_and_unviewable_are_ignored_but_unmapped_is_tracked() {
        let source = FakeSource::default();
        source.add(1, geom(0, 0), MapState::Mapped, WindowClass::InputOnly);
        source.add(2, geom(0, 0), MapState::Unviewable, WindowClass::InputOutput);
        source.add(3, geom(0, 0), MapState::Unmapped, WindowClass::InputOutput);
        let mut registry = Registry::new(&source, 1.0);

        registry.populate(&[1, 2, 3]).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.ids(), vec![3]);
        let record = snapshot.get(3).unwrap();
        assert_eq!(record.map_state, MapState::Unmapped);
        assert!(record.buffer.is_none());
        assert!(!record.is_paintable());
    }

    #[test]
    fn test_map_promotes_unmapped_record() {
        let source = FakeSource::default();
        source.add(3, geom(0, 0), MapState::Unmapped, WindowClass::InputOutput);
        let mut registry = Registry::new(&source, 1.0);
        registry.on_window_created_or_mapped(3).unwrap();

        registry.on_mapped(3).unwrap();

        let snapshot = registry.snapshot();
        let record = snapshot.get(3).unwrap();
        assert_eq!(record.map_state, MapState::Mapped);
        assert!(record.is_paintable());
    }

    #[test]
    fn test_redirection_failure_keeps_window_tracked() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        source.mapped(2, geom(10, 10));
        source.failing.borrow_mut().insert(2);
        let mut registry = Registry::new(&source, 1.0);

        registry.populate(&[1, 2]).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.ids(), vec![1, 2]);
        assert!(snapshot.get(1).unwrap().is_paintable());
        assert!(snapshot.get(2).unwrap().buffer.is_none());
    }

    #[test]
    fn test_unknown_handles_are_noops() {
        let source = FakeSource::default();
        let mut registry = Registry::new(&source, 1.0);

        assert!(registry.on_configure_or_restack(42, geom(1, 1), Some(StackPosition::Top)).is_ok());
        assert!(registry.on_destroyed_or_unmapped(42).is_ok());
        // Created then vanished before attributes could be read
        assert!(registry.on_window_created_or_mapped(42).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_destroy_releases_buffer() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        let mut registry = Registry::new(&source, 1.0);
        registry.on_window_created_or_mapped(1).unwrap();
        let buffer = registry.snapshot().get(1).unwrap().buffer.unwrap();

        registry.on_destroyed_or_unmapped(1).unwrap();
        registry.on_destroyed_or_unmapped(1).unwrap();

        assert!(registry.is_empty());
        assert_eq!(*source.released.borrow(), vec![buffer]);
    }

    #[test]
    fn test_resize_renames_buffer() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        let mut registry = Registry::new(&source, 1.0);
        registry.on_window_created_or_mapped(1).unwrap();
        let before = registry.snapshot().get(1).unwrap().buffer.unwrap();

        // Move only: same buffer
        registry.on_configure_or_restack(1, geom(20, 20), None).unwrap();
        assert_eq!(registry.snapshot().get(1).unwrap().buffer, Some(before));

        registry
            .on_configure_or_restack(1, Geometry::new(20, 20, 300, 200), None)
            .unwrap();
        let snapshot = registry.snapshot();
        let after = snapshot.get(1).unwrap().buffer.unwrap();
        assert_eq!(snapshot.get(1).unwrap().geometry, Geometry::new(20, 20, 300, 200));
        assert_ne!(after.pixmap, before.pixmap);
        // Redirection and damage survive the resize
        assert_eq!(after.damage, before.damage);
        assert_eq!(*source.renamed.borrow(), vec![before.pixmap]);
        assert!(source.released.borrow().is_empty());
    }

    #[test]
    fn test_failed_rename_leaves_window_unpainted() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        let mut registry = Registry::new(&source, 1.0);
        registry.on_window_created_or_mapped(1).unwrap();
        source.failing.borrow_mut().insert(1);

        registry
            .on_configure_or_restack(1, Geometry::new(0, 0, 640, 480), None)
            .unwrap();

        let snapshot = registry.snapshot();
        assert!(snapshot.get(1).unwrap().buffer.is_none());
        assert_eq!(source.released.borrow().len(), 1);
    }

    #[test]
    fn test_restack_above_input_only_sibling() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        source.mapped(2, geom(0, 0));
        source.add(9, geom(0, 0), MapState::Mapped, WindowClass::InputOnly);
        let mut registry = Registry::new(&source, 1.0);
        registry.populate(&[1, 2, 9]).unwrap();
        assert_eq!(registry.snapshot().ids(), vec![1, 2]);

        // Server order becomes 2 9 1
        registry
            .on_configure_or_restack(1, geom(0, 0), Some(StackPosition::Above(9)))
            .unwrap();
        assert_eq!(registry.snapshot().ids(), vec![2, 1]);

        // The InputOnly window itself moves too: 9 2 1, then 2 above it stays put
        registry
            .on_configure_or_restack(9, geom(0, 0), Some(StackPosition::Bottom))
            .unwrap();
        registry
            .on_configure_or_restack(2, geom(0, 0), Some(StackPosition::Above(9)))
            .unwrap();
        assert_eq!(registry.snapshot().ids(), vec![2, 1]);
    }

    #[test]
    fn test_restack_above_excluded_overlay() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        source.mapped(2, geom(0, 0));
        let mut registry = Registry::new(&source, 1.0);
        registry.populate(&[1, 2]).unwrap();
        registry.exclude(OVERLAY).unwrap();
        registry.on_window_created_or_mapped(OVERLAY).unwrap();

        // Overlay sits on top; 1 is raised above it
        registry
            .on_configure_or_restack(1, geom(0, 0), Some(StackPosition::Above(OVERLAY)))
            .unwrap();
        assert_eq!(registry.snapshot().ids(), vec![2, 1]);
    }

    #[test]
    fn test_remap_keeps_stacking_slot() {
        let source = FakeSource::default();
        for id in 1..=3 {
            source.mapped(id, geom(0, 0));
        }
        let mut registry = Registry::new(&source, 1.0);
        registry.populate(&[1, 2, 3]).unwrap();

        registry.on_destroyed_or_unmapped(2).unwrap();
        assert_eq!(registry.snapshot().ids(), vec![1, 3]);
        registry.on_mapped(2).unwrap();
        assert_eq!(registry.snapshot().ids(), vec![1, 2, 3]);

        // Destroy forgets the slot: a recycled id lands on top
        registry.on_destroyed(2).unwrap();
        registry.on_window_created_or_mapped(2).unwrap();
        assert_eq!(registry.snapshot().ids(), vec![1, 3, 2]);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_mutation() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        source.mapped(2, geom(0, 0));
        let mut registry = Registry::new(&source, 0.8);
        registry.populate(&[1, 2]).unwrap();

        let snapshot = registry.snapshot();
        registry.on_destroyed_or_unmapped(1).unwrap();

        assert_eq!(snapshot.ids(), vec![1, 2]);
        assert_eq!(snapshot.get(2).unwrap().opacity, 0.8);
        assert_eq!(registry.snapshot().ids(), vec![2]);
    }

    #[test]
    fn test_dead_server_escalates() {
        let source = FakeSource::default();
        source.dead.set(true);
        let mut registry = Registry::new(&source, 1.0);

        let err = registry.on_window_created_or_mapped(1).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_teardown_releases_everything() {
        let source = FakeSource::default();
        source.mapped(1, geom(0, 0));
        source.mapped(2, geom(0, 0));
        let mut registry = Registry::new(&source, 1.0);
        registry.populate(&[1, 2]).unwrap();

        registry.teardown().unwrap();

        assert!(registry.is_empty());
        assert_eq!(source.released.borrow().len(), 2);
    }
}
