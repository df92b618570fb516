//! OpenGL rendering backend
//!
//! Composites into an offscreen framebuffer sized to the overlay, then blits
//! that framebuffer to the overlay's back buffer and swaps.

use anyhow::{Result, anyhow, bail};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::ptr;
use tracing::{debug, info, trace, warn};

use super::FrameSink;
use super::gl_context::GlContext;
use crate::error::CompositorError;
use crate::registry::{Geometry, RedirectedBuffer, WindowRecord};

/// Unit quad as a triangle fan: position (vec2), texcoord (vec2)
///
/// Texcoords are flipped vertically: pixmap rows start at the top.
const QUAD: [f32; 16] = [
    0.0, 0.0, 0.0, 1.0,
    1.0, 0.0, 1.0, 1.0,
    1.0, 1.0, 1.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
];

const VERTEX_SHADER: &str = r#"
    #version 330 core
    layout (location = 0) in vec2 aPos;
    layout (location = 1) in vec2 aTexCoord;

    uniform vec2 uPosition;
    uniform vec2 uSize;

    out vec2 TexCoord;

    void main() {
        vec2 pos = aPos * uSize + uPosition;
        gl_Position = vec4(pos.x, pos.y, 0.0, 1.0);
        TexCoord = aTexCoord;
    }
"#;

const FRAGMENT_SHADER: &str = r#"
    #version 330 core
    out vec4 FragColor;

    in vec2 TexCoord;

    uniform sampler2D uTexture;
    uniform float uOpacity;
    uniform bool uOpaque;

    void main() {
        vec4 texColor = texture(uTexture, TexCoord);
        float alpha = uOpaque ? 1.0 : texColor.a;
        FragColor = vec4(texColor.rgb, alpha * uOpacity);
    }
"#;

/// Window geometry converted to normalized device coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadPlacement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl QuadPlacement {
    /// X11 coordinates (top-left origin) to GL clip space (bottom-left origin)
    pub fn new(geometry: &Geometry, screen_width: u16, screen_height: u16) -> Self {
        let sw = screen_width.max(1) as f32;
        let sh = screen_height.max(1) as f32;
        let (x, y) = (geometry.x as f32, geometry.y as f32);
        let (w, h) = (geometry.width as f32, geometry.height as f32);
        Self {
            x: (x / sw) * 2.0 - 1.0,
            y: 1.0 - ((y + h) / sh) * 2.0,
            width: (w / sw) * 2.0,
            height: (h / sh) * 2.0,
        }
    }
}

/// Texture resources for one redirected pixmap
struct WindowTexture {
    texture: u32,
    glx_pixmap: u64,
}

struct Uniforms {
    position: i32,
    size: i32,
    opacity: i32,
    opaque: i32,
    texture: i32,
}

/// GPU state owned by the render thread
pub struct RenderContext {
    gl: GlContext,
    framebuffer: u32,
    colorbuffer: u32,
    program: u32,
    uniforms: Uniforms,
    vao: u32,
    vbo: u32,
    width: u16,
    height: u16,
    background: [f32; 4],
    textures: HashMap<u32, WindowTexture>, // X11 pixmap -> texture
    drawn: HashSet<u32>,
}

impl RenderContext {
    /// Set up GL on the overlay: framebuffer, color buffer, shader, quad
    pub fn initialize(
        gl_context: GlContext,
        width: u16,
        height: u16,
        background: [f32; 4],
    ) -> Result<Self, CompositorError> {
        Self::create(gl_context, width, height, background)
            .map_err(|e| CompositorError::GpuInit(format!("{:#}", e)))
    }

    fn create(gl_context: GlContext, width: u16, height: u16, background: [f32; 4]) -> Result<Self> {
        unsafe {
            let mut framebuffer = 0;
            let mut colorbuffer = 0;
            gl::GenFramebuffers(1, &mut framebuffer);
            gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer);
            gl::GenRenderbuffers(1, &mut colorbuffer);
            gl::BindRenderbuffer(gl::RENDERBUFFER, colorbuffer);
            gl::RenderbufferStorage(gl::RENDERBUFFER, gl::RGBA8, width as i32, height as i32);
            gl::FramebufferRenderbuffer(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::RENDERBUFFER,
                colorbuffer,
            );
            Self::check_framebuffer()?;

            let program = Self::create_shader_program()?;
            let uniforms = Uniforms {
                position: Self::uniform(program, "uPosition"),
                size: Self::uniform(program, "uSize"),
                opacity: Self::uniform(program, "uOpacity"),
                opaque: Self::uniform(program, "uOpaque"),
                texture: Self::uniform(program, "uTexture"),
            };

            let mut vao = 0;
            let mut vbo = 0;
            gl::GenVertexArrays(1, &mut vao);
            gl::GenBuffers(1, &mut vbo);
            gl::BindVertexArray(vao);
            gl::BindBuffer(gl::ARRAY_BUFFER, vbo);
            let bytes: &[u8] = bytemuck::cast_slice(&QUAD);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                bytes.len() as isize,
                bytes.as_ptr() as *const _,
                gl::STATIC_DRAW,
            );
            let stride = 4 * std::mem::size_of::<f32>() as i32;
            gl::VertexAttribPointer(0, 2, gl::FLOAT, gl::FALSE, stride, ptr::null());
            gl::EnableVertexAttribArray(0);
            gl::VertexAttribPointer(
                1,
                2,
                gl::FLOAT,
                gl::FALSE,
                stride,
                (2 * std::mem::size_of::<f32>()) as *const _,
            );
            gl::EnableVertexAttribArray(1);
            gl::BindVertexArray(0);

            gl::Viewport(0, 0, width as i32, height as i32);
            info!("Render pipeline ready ({}x{} framebuffer)", width, height);

            Ok(Self {
                gl: gl_context,
                framebuffer,
                colorbuffer,
                program,
                uniforms,
                vao,
                vbo,
                width,
                height,
                background,
                textures: HashMap::new(),
                drawn: HashSet::new(),
            })
        }
    }

    fn check_framebuffer() -> Result<()> {
        let status = unsafe { gl::CheckFramebufferStatus(gl::FRAMEBUFFER) };
        if status != gl::FRAMEBUFFER_COMPLETE {
            bail!("framebuffer incomplete (status 0x{:x})", status);
        }
        Ok(())
    }

    fn uniform(program: u32, name: &str) -> i32 {
        match CString::new(name) {
            Ok(name) => unsafe { gl::GetUniformLocation(program, name.as_ptr()) },
            Err(_) => -1,
        }
    }

    fn create_shader_program() -> Result<u32> {
        unsafe {
            let vs = Self::compile_shader(VERTEX_SHADER, gl::VERTEX_SHADER)?;
            let fs = match Self::compile_shader(FRAGMENT_SHADER, gl::FRAGMENT_SHADER) {
                Ok(fs) => fs,
                Err(e) => {
                    gl::DeleteShader(vs);
                    return Err(e);
                }
            };
            let program = Self::link_program(vs, fs);
            gl::DeleteShader(vs);
            gl::DeleteShader(fs);
            program
        }
    }

    fn compile_shader(source: &str, shader_type: u32) -> Result<u32> {
        let c_str = CString::new(source)?;
        unsafe {
            let shader = gl::CreateShader(shader_type);
            gl::ShaderSource(shader, 1, &c_str.as_ptr(), ptr::null());
            gl::CompileShader(shader);

            let mut success = 0;
            gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut success);
            if success == 0 {
                let mut len = 0;
                gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
                let mut buffer = vec![0u8; len.max(1) as usize];
                gl::GetShaderInfoLog(shader, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
                gl::DeleteShader(shader);
                return Err(anyhow!(
                    "Shader compilation failed: {}",
                    String::from_utf8_lossy(&buffer)
                ));
            }
            Ok(shader)
        }
    }

    fn link_program(vs: u32, fs: u32) -> Result<u32> {
        unsafe {
            let program = gl::CreateProgram();
            gl::AttachShader(program, vs);
            gl::AttachShader(program, fs);
            gl::LinkProgram(program);

            let mut success = 0;
            gl::GetProgramiv(program, gl::LINK_STATUS, &mut success);
            if success == 0 {
                let mut len = 0;
                gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
                let mut buffer = vec![0u8; len.max(1) as usize];
                gl::GetProgramInfoLog(program, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
                gl::DeleteProgram(program);
                return Err(anyhow!(
                    "Program linking failed: {}",
                    String::from_utf8_lossy(&buffer)
                ));
            }
            Ok(program)
        }
    }

    /// Reallocate the color buffer for new overlay dimensions
    pub fn resize(&mut self, width: u16, height: u16) -> Result<(), CompositorError> {
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        self.gl
            .make_current()
            .map_err(|e| CompositorError::GpuInit(e.to_string()))?;
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, self.framebuffer);
            gl::BindRenderbuffer(gl::RENDERBUFFER, self.colorbuffer);
            gl::RenderbufferStorage(gl::RENDERBUFFER, gl::RGBA8, width as i32, height as i32);
            gl::Viewport(0, 0, width as i32, height as i32);
        }
        Self::check_framebuffer().map_err(|e| CompositorError::GpuInit(e.to_string()))?;
        self.width = width;
        self.height = height;
        info!("Framebuffer resized to {}x{}", width, height);
        Ok(())
    }

    fn texture_for(&mut self, buffer: &RedirectedBuffer) -> Result<&WindowTexture> {
        if !self.textures.contains_key(&buffer.pixmap) {
            let glx_pixmap = self.gl.create_glx_pixmap(buffer.pixmap, buffer.depth)?;
            let mut texture = 0;
            unsafe {
                gl::GenTextures(1, &mut texture);
                gl::BindTexture(gl::TEXTURE_2D, texture);
                gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
                gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
                gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
                gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
                gl::BindTexture(gl::TEXTURE_2D, 0);
            }
            trace!(
                "Created texture {} (GLX pixmap 0x{:x}) for pixmap 0x{:x}",
                texture, glx_pixmap, buffer.pixmap
            );
            self.textures
                .insert(buffer.pixmap, WindowTexture { texture, glx_pixmap });
        }
        self.textures
            .get(&buffer.pixmap)
            .ok_or_else(|| anyhow!("texture cache miss for pixmap 0x{:x}", buffer.pixmap))
    }

    /// Free textures whose pixmaps were not drawn this frame
    fn prune_textures(&mut self) {
        let drawn = std::mem::take(&mut self.drawn);
        let stale: Vec<u32> = self
            .textures
            .keys()
            .filter(|pixmap| !drawn.contains(pixmap))
            .copied()
            .collect();
        for pixmap in stale {
            if let Some(tex) = self.textures.remove(&pixmap) {
                self.gl.destroy_glx_pixmap(tex.glx_pixmap);
                unsafe { gl::DeleteTextures(1, &tex.texture) };
                trace!("Dropped texture for pixmap 0x{:x}", pixmap);
            }
        }
    }
}

impl FrameSink for RenderContext {
    fn clear(&mut self) -> Result<(), CompositorError> {
        self.gl
            .make_current()
            .map_err(|e| CompositorError::GpuInit(e.to_string()))?;
        let [r, g, b, a] = self.background;
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, self.framebuffer);
            gl::Viewport(0, 0, self.width as i32, self.height as i32);
            gl::ClearColor(r, g, b, a);
            gl::Clear(gl::COLOR_BUFFER_BIT);
            gl::Enable(gl::BLEND);
            gl::BlendFunc(gl::SRC_ALPHA, gl::ONE_MINUS_SRC_ALPHA);
            gl::UseProgram(self.program);
            gl::BindVertexArray(self.vao);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::Uniform1i(self.uniforms.texture, 0);
        }
        Ok(())
    }

    fn draw_window(
        &mut self,
        window: &WindowRecord,
        buffer: &RedirectedBuffer,
    ) -> Result<(), CompositorError> {
        let placement = QuadPlacement::new(&window.geometry, self.width, self.height);
        let (texture, glx_pixmap) = match self.texture_for(buffer) {
            Ok(tex) => (tex.texture, tex.glx_pixmap),
            Err(e) => {
                return Err(CompositorError::RedirectionFailed {
                    window: window.id,
                    reason: e.to_string(),
                });
            }
        };
        self.drawn.insert(buffer.pixmap);

        unsafe {
            gl::Uniform2f(self.uniforms.position, placement.x, placement.y);
            gl::Uniform2f(self.uniforms.size, placement.width, placement.height);
            gl::Uniform1f(self.uniforms.opacity, window.opacity);
            gl::Uniform1i(self.uniforms.opaque, (buffer.depth != 32) as i32);

            gl::BindTexture(gl::TEXTURE_2D, texture);
            self.gl.bind_tex_image(glx_pixmap);
            gl::DrawArrays(gl::TRIANGLE_FAN, 0, 4);
            self.gl.release_tex_image(glx_pixmap);
            gl::BindTexture(gl::TEXTURE_2D, 0);

            let err = gl::GetError();
            if err != gl::NO_ERROR {
                warn!("OpenGL error 0x{:x} drawing window 0x{:x}", err, window.id);
            }
        }
        Ok(())
    }

    fn present(&mut self) -> Result<(), CompositorError> {
        let (w, h) = (self.width as i32, self.height as i32);
        unsafe {
            gl::BindVertexArray(0);
            gl::BindFramebuffer(gl::READ_FRAMEBUFFER, self.framebuffer);
            gl::BindFramebuffer(gl::DRAW_FRAMEBUFFER, 0);
            gl::BlitFramebuffer(0, 0, w, h, 0, 0, w, h, gl::COLOR_BUFFER_BIT, gl::NEAREST);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
        }
        self.gl.swap_buffers();
        self.prune_textures();
        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.gl.make_current() {
            warn!("Could not make GL context current for teardown: {}", e);
            return;
        }
        unsafe {
            for tex in self.textures.values() {
                self.gl.destroy_glx_pixmap(tex.glx_pixmap);
                gl::DeleteTextures(1, &tex.texture);
            }
            gl::DeleteBuffers(1, &self.vbo);
            gl::DeleteVertexArrays(1, &self.vao);
            gl::DeleteProgram(self.program);
            gl::DeleteRenderbuffers(1, &self.colorbuffer);
            gl::DeleteFramebuffers(1, &self.framebuffer);
        }
        debug!("Render context torn down");
    }
}
