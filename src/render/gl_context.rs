//! OpenGL context creation using GLX directly
//!
//! The context is made current on the overlay window. Window contents are
//! sampled through GLX_EXT_texture_from_pixmap, so the redirected pixmaps are
//! never copied through the client.

use anyhow::{Context, Result, anyhow, bail};
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use x11_dl::glx::{self, Glx};
use x11_dl::xlib::{self, Xlib};

// TFP (Texture From Pixmap) attributes
const GLX_BIND_TO_TEXTURE_RGB_EXT: i32 = 0x20D0;
const GLX_BIND_TO_TEXTURE_RGBA_EXT: i32 = 0x20D1;
const GLX_BIND_TO_TEXTURE_TARGETS_EXT: i32 = 0x20D3;
const GLX_TEXTURE_2D_BIT_EXT: i32 = 0x0002;
const GLX_TEXTURE_FORMAT_EXT: i32 = 0x20D5;
const GLX_TEXTURE_TARGET_EXT: i32 = 0x20D6;
const GLX_TEXTURE_2D_EXT: i32 = 0x20DC;
const GLX_TEXTURE_FORMAT_RGB_EXT: i32 = 0x20D9;
const GLX_TEXTURE_FORMAT_RGBA_EXT: i32 = 0x20DA;
const GLX_FRONT_LEFT_EXT: i32 = 0x20DE;
const GLX_MIPMAP_TEXTURE_EXT: i32 = 0x20D7;

static X_ERROR_OCCURRED: AtomicBool = AtomicBool::new(false);

// Returning 0 keeps Xlib's default handler (which exits) out of the way
unsafe extern "C" fn x_error_handler(
    _display: *mut xlib::Display,
    event: *mut xlib::XErrorEvent,
) -> i32 {
    if !event.is_null() {
        let (error_code, request_code, minor_code) =
            unsafe { ((*event).error_code, (*event).request_code, (*event).minor_code) };
        X_ERROR_OCCURRED.store(true, Ordering::Relaxed);
        debug!(
            "X error on GLX connection: code={}, request={}, minor={}",
            error_code, request_code, minor_code
        );
    }
    0
}

type BindTexImageFn = unsafe extern "C" fn(*mut xlib::Display, u64, i32, *const i32);
type ReleaseTexImageFn = unsafe extern "C" fn(*mut xlib::Display, u64, i32);
type SwapIntervalFn = unsafe extern "C" fn(*mut xlib::Display, u64, i32);

/// Texture format a pixmap of the given depth binds as
pub fn texture_format_for_depth(depth: u8) -> i32 {
    if depth == 32 {
        GLX_TEXTURE_FORMAT_RGBA_EXT
    } else {
        GLX_TEXTURE_FORMAT_RGB_EXT
    }
}

/// OpenGL context wrapper using GLX
pub struct GlContext {
    glx: Glx,
    xlib: Xlib,
    display: *mut xlib::Display,
    context: glx::GLXContext,
    drawable: u64, // overlay window
    screen_num: i32,
    config: glx::GLXFBConfig,
    bind_tex_image_fn: BindTexImageFn,
    release_tex_image_fn: ReleaseTexImageFn,
}

impl GlContext {
    /// Create a context bound to `overlay` and load GL entry points
    pub fn new(display_name: Option<&str>, screen_num: usize, overlay: u32, vsync: bool) -> Result<Self> {
        let xlib = Xlib::open().context("Failed to load libX11")?;
        let glx = Glx::open().context("Failed to load libGLX")?;

        let display_cstr = display_name.map(CString::new).transpose()?;
        let display = unsafe {
            (xlib.XOpenDisplay)(display_cstr.as_ref().map_or(ptr::null(), |s| s.as_ptr()))
        };
        if display.is_null() {
            bail!("Failed to open X11 display for GLX");
        }
        unsafe { (xlib.XSetErrorHandler)(Some(x_error_handler)) };

        match Self::setup(glx, xlib, display, screen_num as i32, overlay, vsync) {
            Ok(ctx) => Ok(ctx),
            Err((xlib, e)) => {
                unsafe { (xlib.XCloseDisplay)(display) };
                Err(e)
            }
        }
    }

    fn setup(
        glx: Glx,
        xlib: Xlib,
        display: *mut xlib::Display,
        screen_num: i32,
        overlay: u32,
        vsync: bool,
    ) -> std::result::Result<Self, (Xlib, anyhow::Error)> {
        let mut major = 0;
        let mut minor = 0;
        unsafe { (glx.glXQueryVersion)(display, &mut major, &mut minor) };
        info!("GLX version {}.{}", major, minor);

        let extensions = unsafe {
            let s = (glx.glXQueryExtensionsString)(display, screen_num);
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        };
        if !extensions.contains("GLX_EXT_texture_from_pixmap") {
            return Err((xlib, anyhow!("GLX_EXT_texture_from_pixmap not supported")));
        }

        let attribs = [
            glx::GLX_DRAWABLE_TYPE as i32, glx::GLX_WINDOW_BIT as i32 | glx::GLX_PIXMAP_BIT as i32,
            glx::GLX_RENDER_TYPE as i32, glx::GLX_RGBA_BIT as i32,
            glx::GLX_DOUBLEBUFFER as i32, 1,
            glx::GLX_RED_SIZE as i32, 8,
            glx::GLX_GREEN_SIZE as i32, 8,
            glx::GLX_BLUE_SIZE as i32, 8,
            GLX_BIND_TO_TEXTURE_RGBA_EXT, 1,
            GLX_BIND_TO_TEXTURE_TARGETS_EXT, GLX_TEXTURE_2D_BIT_EXT,
            0,
        ];

        let mut num_configs = 0;
        let configs = unsafe {
            (glx.glXChooseFBConfig)(display, screen_num, attribs.as_ptr(), &mut num_configs)
        };
        if configs.is_null() || num_configs == 0 {
            return Err((xlib, anyhow!("No suitable GLX FBConfig found (check TFP support)")));
        }
        let config = unsafe { *configs };
        unsafe { (xlib.XFree)(configs as *mut _) };

        let context = unsafe {
            (glx.glXCreateNewContext)(display, config, glx::GLX_RGBA_TYPE as i32, ptr::null_mut(), 1)
        };
        if context.is_null() {
            return Err((xlib, anyhow!("glXCreateNewContext failed")));
        }

        let drawable = overlay as u64;
        if unsafe { (glx.glXMakeCurrent)(display, drawable, context) } == 0 {
            unsafe { (glx.glXDestroyContext)(display, context) };
            return Err((xlib, anyhow!("glXMakeCurrent on overlay 0x{:x} failed", overlay)));
        }

        gl::load_with(|symbol| Self::proc_address(&glx, symbol));

        let bind_tex = Self::proc_address(&glx, "glXBindTexImageEXT");
        let release_tex = Self::proc_address(&glx, "glXReleaseTexImageEXT");
        if bind_tex.is_null() || release_tex.is_null() {
            unsafe { (glx.glXDestroyContext)(display, context) };
            return Err((xlib, anyhow!("GLX_EXT_texture_from_pixmap functions missing")));
        }
        let bind_tex_image_fn: BindTexImageFn = unsafe { std::mem::transmute(bind_tex) };
        let release_tex_image_fn: ReleaseTexImageFn = unsafe { std::mem::transmute(release_tex) };

        let swap_interval = Self::proc_address(&glx, "glXSwapIntervalEXT");
        if swap_interval.is_null() {
            warn!("glXSwapIntervalEXT not supported, swap interval left at driver default");
        } else {
            let swap_fn: SwapIntervalFn = unsafe { std::mem::transmute(swap_interval) };
            let interval = if vsync { 1 } else { 0 };
            unsafe { swap_fn(display, drawable, interval) };
            debug!("Swap interval set to {}", interval);
        }

        info!("GLX context created on overlay 0x{:x} (TFP enabled)", overlay);
        Ok(Self {
            glx,
            xlib,
            display,
            context,
            drawable,
            screen_num,
            config,
            bind_tex_image_fn,
            release_tex_image_fn,
        })
    }

    fn proc_address(glx: &Glx, symbol: &str) -> *const std::ffi::c_void {
        let Ok(name) = CString::new(symbol) else {
            return ptr::null();
        };
        match unsafe { (glx.glXGetProcAddress)(name.as_ptr() as *const _) } {
            Some(f) => f as *const _,
            None => ptr::null(),
        }
    }

    pub fn swap_buffers(&self) {
        unsafe { (self.glx.glXSwapBuffers)(self.display, self.drawable) };
    }

    pub fn make_current(&self) -> Result<()> {
        if unsafe { (self.glx.glXMakeCurrent)(self.display, self.drawable, self.context) } == 0 {
            bail!("glXMakeCurrent failed");
        }
        Ok(())
    }

    /// Find a TFP-capable FBConfig for pixmaps of `depth`
    fn config_for_depth(&self, depth: u8) -> Option<glx::GLXFBConfig> {
        let bind_attr = if depth == 32 {
            GLX_BIND_TO_TEXTURE_RGBA_EXT
        } else {
            GLX_BIND_TO_TEXTURE_RGB_EXT
        };
        let alpha = if depth == 32 { 8 } else { 0 };
        let attribs = [
            glx::GLX_DRAWABLE_TYPE as i32, glx::GLX_PIXMAP_BIT as i32,
            glx::GLX_RENDER_TYPE as i32, glx::GLX_RGBA_BIT as i32,
            bind_attr, 1,
            GLX_BIND_TO_TEXTURE_TARGETS_EXT, GLX_TEXTURE_2D_BIT_EXT,
            glx::GLX_ALPHA_SIZE as i32, alpha,
            glx::GLX_BUFFER_SIZE as i32, depth as i32,
            0,
        ];

        let mut num_configs = 0;
        let configs = unsafe {
            (self.glx.glXChooseFBConfig)(self.display, self.screen_num, attribs.as_ptr(), &mut num_configs)
        };
        if configs.is_null() || num_configs == 0 {
            return None;
        }
        let config = unsafe { *configs };
        unsafe { (self.xlib.XFree)(configs as *mut _) };
        Some(config)
    }

    /// Create a GLX pixmap wrapping an X11 pixmap of `depth`
    pub fn create_glx_pixmap(&self, pixmap: u32, depth: u8) -> Result<u64> {
        let config = self.config_for_depth(depth).unwrap_or_else(|| {
            debug!("No FBConfig for depth {}, using the context config", depth);
            self.config
        });

        let attribs = [
            GLX_TEXTURE_FORMAT_EXT, texture_format_for_depth(depth),
            GLX_TEXTURE_TARGET_EXT, GLX_TEXTURE_2D_EXT,
            GLX_MIPMAP_TEXTURE_EXT, 0,
            0,
        ];

        // The pixmap may already be freed by the event loop; errors arrive async
        X_ERROR_OCCURRED.store(false, Ordering::Relaxed);
        let glx_pixmap = unsafe {
            let glx_pixmap =
                (self.glx.glXCreatePixmap)(self.display, config, pixmap as u64, attribs.as_ptr());
            (self.xlib.XSync)(self.display, xlib::False);
            glx_pixmap
        };
        if X_ERROR_OCCURRED.swap(false, Ordering::Relaxed) {
            if glx_pixmap != 0 {
                self.destroy_glx_pixmap(glx_pixmap);
            }
            bail!("X error creating GLX pixmap for pixmap 0x{:x}", pixmap);
        }
        if glx_pixmap == 0 {
            bail!("glXCreatePixmap failed for pixmap 0x{:x} (depth {})", pixmap, depth);
        }
        Ok(glx_pixmap)
    }

    pub fn destroy_glx_pixmap(&self, glx_pixmap: u64) {
        unsafe { (self.glx.glXDestroyPixmap)(self.display, glx_pixmap) };
    }

    /// Bind a GLX pixmap to the current texture unit
    pub fn bind_tex_image(&self, glx_pixmap: u64) {
        unsafe { (self.bind_tex_image_fn)(self.display, glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null()) };
    }

    pub fn release_tex_image(&self, glx_pixmap: u64) {
        unsafe { (self.release_tex_image_fn)(self.display, glx_pixmap, GLX_FRONT_LEFT_EXT) };
    }
}

impl Drop for GlContext {
    fn drop(&mut self) {
        unsafe {
            (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
            (self.glx.glXDestroyContext)(self.display, self.context);
            (self.xlib.XCloseDisplay)(self.display);
        }
    }
}
