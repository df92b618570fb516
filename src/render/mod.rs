//! Render Pipeline
//!
//! Composites registry snapshots onto the overlay. The GL context lives on a
//! dedicated thread; the event loop only hands it immutable snapshots.

pub mod gl_context;
pub mod meter;
pub mod renderer;

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc as async_mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::error::CompositorError;
use crate::registry::{RedirectedBuffer, Snapshot, WindowRecord};
use gl_context::GlContext;
use meter::FrameMeter;
use renderer::RenderContext;

/// Drawing operations one composite pass needs
pub trait FrameSink {
    /// Clear the frame before any window is drawn
    fn clear(&mut self) -> Result<(), CompositorError>;

    /// Draw one window's buffer as a textured quad at its geometry
    fn draw_window(
        &mut self,
        window: &WindowRecord,
        buffer: &RedirectedBuffer,
    ) -> Result<(), CompositorError>;

    /// Present the finished frame on the overlay
    fn present(&mut self) -> Result<(), CompositorError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub drawn: usize,
    pub skipped: usize,
}

/// Paint `snapshot` bottom to top and present it
///
/// Windows without a redirected buffer, unmapped windows and windows whose
/// draw fails are skipped; only frame-level failures abort.
pub fn composite<S: FrameSink + ?Sized>(
    sink: &mut S,
    snapshot: &Snapshot,
) -> Result<FrameStats, CompositorError> {
    let mut stats = FrameStats::default();
    if snapshot.is_empty() {
        trace!("Compositing an empty stack");
    }
    sink.clear()?;

    for window in snapshot.windows() {
        let buffer = match window.buffer.as_ref() {
            Some(buffer) if window.is_paintable() => buffer,
            _ => {
                stats.skipped += 1;
                continue;
            }
        };

        match sink.draw_window(window, buffer) {
            Ok(()) => stats.drawn += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Skipping window 0x{:x} this frame: {}", window.id, e);
                stats.skipped += 1;
            }
        }
    }

    sink.present()?;
    Ok(stats)
}

/// Messages from the event loop to the render thread
#[derive(Debug)]
pub enum RenderCommand {
    Frame(Snapshot),
    Resize { width: u16, height: u16 },
    Shutdown,
}

/// Work collected from the command queue before one pass
#[derive(Debug, Default)]
struct Pending {
    frame: Option<Snapshot>,
    resize: Option<(u16, u16)>,
    shutdown: bool,
}

impl Pending {
    fn apply(&mut self, command: RenderCommand) {
        match command {
            // A newer frame supersedes anything still queued
            RenderCommand::Frame(snapshot) => self.frame = Some(snapshot),
            RenderCommand::Resize { width, height } => self.resize = Some((width, height)),
            RenderCommand::Shutdown => self.shutdown = true,
        }
    }
}

/// Block for one command, then drain whatever else is already queued
fn collect(rx: &mpsc::Receiver<RenderCommand>) -> Option<Pending> {
    let first = rx.recv().ok()?;
    let mut pending = Pending::default();
    pending.apply(first);
    while let Ok(command) = rx.try_recv() {
        pending.apply(command);
    }
    Some(pending)
}

/// Parameters for the render thread
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub display: Option<String>,
    pub screen_num: usize,
    pub overlay: u32,
    pub width: u16,
    pub height: u16,
    pub vsync: bool,
    pub background: [f32; 4],
}

/// Handle to the render thread
pub struct RenderPipeline {
    tx: mpsc::Sender<RenderCommand>,
    thread: Option<JoinHandle<()>>,
}

impl RenderPipeline {
    /// Start the render thread and wait until its GL state is ready
    ///
    /// Fatal errors the thread hits later are sent on `errors`.
    pub async fn spawn(
        settings: RenderSettings,
        errors: async_mpsc::UnboundedSender<CompositorError>,
    ) -> Result<Self, CompositorError> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("scrim-render".into())
            .spawn(move || render_thread(settings, rx, ready_tx, errors))
            .map_err(|e| CompositorError::GpuInit(format!("failed to spawn render thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { tx, thread: Some(thread) }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CompositorError::GpuInit("render thread exited during setup".into()))
            }
        }
    }

    /// Queue a snapshot for compositing
    pub fn submit(&self, snapshot: Snapshot) -> Result<(), CompositorError> {
        self.send(RenderCommand::Frame(snapshot))
    }

    pub fn resize(&self, width: u16, height: u16) -> Result<(), CompositorError> {
        self.send(RenderCommand::Resize { width, height })
    }

    fn send(&self, command: RenderCommand) -> Result<(), CompositorError> {
        self.tx
            .send(command)
            .map_err(|_| CompositorError::GpuInit("render thread is gone".into()))
    }

    /// Stop the thread; the GL context is destroyed on it before this returns
    pub fn shutdown(mut self) {
        let _ = self.tx.send(RenderCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Render thread panicked");
            }
        }
        info!("Render pipeline stopped");
    }
}

fn render_thread(
    settings: RenderSettings,
    rx: mpsc::Receiver<RenderCommand>,
    ready: oneshot::Sender<Result<(), CompositorError>>,
    errors: async_mpsc::UnboundedSender<CompositorError>,
) {
    let context = GlContext::new(
        settings.display.as_deref(),
        settings.screen_num,
        settings.overlay,
        settings.vsync,
    )
    .map_err(|e| CompositorError::GpuInit(format!("{:#}", e)))
    .and_then(|gl| {
        RenderContext::initialize(gl, settings.width, settings.height, settings.background)
    });

    let mut context = match context {
        Ok(context) => {
            let _ = ready.send(Ok(()));
            context
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut meter = FrameMeter::new(Duration::from_secs(5));
    while let Some(pending) = collect(&rx) {
        if let Some((width, height)) = pending.resize {
            if let Err(e) = context.resize(width, height) {
                let _ = errors.send(e);
                break;
            }
        }
        if pending.shutdown {
            break;
        }
        if let Some(snapshot) = pending.frame {
            match composite(&mut context, &snapshot) {
                Ok(stats) => {
                    trace!("Frame: {} drawn, {} skipped", stats.drawn, stats.skipped);
                    if let Some(report) = meter.record(stats) {
                        debug!(
                            "Compositor {:.1} FPS over {} frames, {:.1} windows per frame, {} skipped",
                            report.fps, report.frames, report.drawn_per_frame, report.skipped
                        );
                    }
                }
                Err(e) => {
                    let _ = errors.send(e);
                    break;
                }
            }
        }
    }

    drop(context);
    debug!("Render thread exiting after {} frames", meter.total_frames());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::FakeSource;
    use crate::registry::{Geometry, Registry};

    #[derive(Debug, PartialEq)]
    enum Call {
        Clear,
        Draw(u32),
        Present,
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<Call>,
        fail_draw: Option<u32>,
        fail_present: bool,
    }

    impl FrameSink for RecordingSink {
        fn clear(&mut self) -> Result<(), CompositorError> {
            self.calls.push(Call::Clear);
            Ok(())
        }

        fn draw_window(
            &mut self,
            window: &WindowRecord,
            _buffer: &RedirectedBuffer,
        ) -> Result<(), CompositorError> {
            if self.fail_draw == Some(window.id) {
                return Err(CompositorError::RedirectionFailed {
                    window: window.id,
                    reason: "glXCreatePixmap failed".into(),
                });
            }
            self.calls.push(Call::Draw(window.id));
            Ok(())
        }

        fn present(&mut self) -> Result<(), CompositorError> {
            if self.fail_present {
                return Err(CompositorError::GpuInit("context lost".into()));
            }
            self.calls.push(Call::Present);
            Ok(())
        }
    }

    fn snapshot_of(source: &FakeSource, ids: &[u32]) -> Snapshot {
        let mut registry = Registry::new(source, 1.0);
        registry.populate(ids).unwrap();
        registry.snapshot()
    }

    #[test]
    fn test_two_windows_draw_in_order_then_present() {
        let source = FakeSource::default();
        source.mapped(1, Geometry::new(0, 0, 100, 100));
        source.mapped(2, Geometry::new(50, 50, 100, 100));
        let snapshot = snapshot_of(&source, &[1, 2]);
        assert_eq!(snapshot.len(), 2);

        let mut sink = RecordingSink::default();
        let stats = composite(&mut sink, &snapshot).unwrap();

        assert_eq!(sink.calls, vec![Call::Clear, Call::Draw(1), Call::Draw(2), Call::Present]);
        assert_eq!(stats, FrameStats { drawn: 2, skipped: 0 });
    }

    #[test]
    fn test_unredirected_window_is_skipped_without_disturbing_others() {
        let source = FakeSource::default();
        for id in 1..=3 {
            source.mapped(id, Geometry::new(0, 0, 100, 100));
        }
        source.failing.borrow_mut().insert(2);
        let snapshot = snapshot_of(&source, &[1, 2, 3]);
        assert_eq!(snapshot.ids(), vec![1, 2, 3]);

        let mut sink = RecordingSink::default();
        let stats = composite(&mut sink, &snapshot).unwrap();

        assert_eq!(sink.calls, vec![Call::Clear, Call::Draw(1), Call::Draw(3), Call::Present]);
        assert_eq!(stats, FrameStats { drawn: 2, skipped: 1 });
    }

    #[test]
    fn test_per_window_draw_failure_does_not_abort_frame() {
        let source = FakeSource::default();
        source.mapped(1, Geometry::new(0, 0, 100, 100));
        source.mapped(2, Geometry::new(0, 0, 100, 100));
        let snapshot = snapshot_of(&source, &[1, 2]);

        let mut sink = RecordingSink { fail_draw: Some(1), ..Default::default() };
        let stats = composite(&mut sink, &snapshot).unwrap();

        assert_eq!(sink.calls, vec![Call::Clear, Call::Draw(2), Call::Present]);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_present_failure_is_fatal() {
        let mut sink = RecordingSink { fail_present: true, ..Default::default() };
        let err = composite(&mut sink, &Snapshot::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_empty_snapshot_still_presents() {
        let snapshot = Snapshot::default();
        assert!(snapshot.is_empty());
        let mut sink = RecordingSink::default();
        composite(&mut sink, &snapshot).unwrap();
        assert_eq!(sink.calls, vec![Call::Clear, Call::Present]);
    }

    #[test]
    fn test_collect_keeps_newest_frame() {
        let source = FakeSource::default();
        source.mapped(1, Geometry::new(0, 0, 10, 10));
        let (tx, rx) = mpsc::channel();
        tx.send(RenderCommand::Frame(Snapshot::default())).unwrap();
        tx.send(RenderCommand::Resize { width: 800, height: 600 }).unwrap();
        tx.send(RenderCommand::Frame(snapshot_of(&source, &[1]))).unwrap();

        let pending = collect(&rx).unwrap();
        assert_eq!(pending.frame.unwrap().ids(), vec![1]);
        assert_eq!(pending.resize, Some((800, 600)));
        assert!(!pending.shutdown);
    }

    #[test]
    fn test_collect_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::channel::<RenderCommand>();
        tx.send(RenderCommand::Shutdown).unwrap();
        drop(tx);

        assert!(collect(&rx).unwrap().shutdown);
        assert!(collect(&rx).is_none());
    }
}
