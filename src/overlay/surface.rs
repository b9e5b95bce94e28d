//! Transparent, click-through, always-on-top X11 surface
//!
//! An override-redirect window on a 32-bit ARGB visual. Frames are uploaded
//! into a back pixmap and swapped onto the window with a single RENDER
//! composite, so a half-uploaded frame is never visible.

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ConnectionError;
use x11rb::protocol::render::{ConnectionExt as RenderExt, CreatePictureAux, PictOp, Picture};
use x11rb::protocol::shape::SK;
use x11rb::protocol::xfixes::ConnectionExt as XFixesExt;
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as WrapperExt;

use super::OverlayDisplay;
use crate::compositor::Raster;
use crate::constants::x11;
use crate::lifecycle::ReleaseOnce;
use crate::x11_utils::{find_argb_visual, get_pictformat, CachedAtoms};

/// Rows of `width` ARGB pixels that fit in one PutImage request
pub fn rows_per_request(max_request_bytes: usize, width: u32) -> usize {
    let row_bytes = (width as usize * x11::ARGB_BYTES_PER_PIXEL).max(1);
    (max_request_bytes.saturating_sub(x11::PUT_IMAGE_HEADER_BYTES) / row_bytes).max(1)
}

/// A server-side object created while building the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Colormap(Colormap),
    Window(Window),
    Pixmap(Pixmap),
    Picture(Picture),
    Gc(Gcontext),
}

impl Resource {
    fn free(self, conn: &RustConnection) -> Result<(), ConnectionError> {
        match self {
            Resource::Colormap(id) => conn.free_colormap(id).map(drop),
            Resource::Window(id) => conn.destroy_window(id).map(drop),
            Resource::Pixmap(id) => conn.free_pixmap(id).map(drop),
            Resource::Picture(id) => conn.render_free_picture(id).map(drop),
            Resource::Gc(id) => conn.free_gc(id).map(drop),
        }
    }
}

/// Objects created so far, in creation order
#[derive(Debug, Default)]
struct CreatedResources {
    created: Vec<Resource>,
}

impl CreatedResources {
    fn track(&mut self, resource: Resource) {
        self.created.push(resource);
    }

    /// Dependents go first: pictures and gc before their drawables, the window before its colormap
    fn teardown_order(&self) -> impl Iterator<Item = Resource> + '_ {
        self.created.iter().rev().copied()
    }
}

/// Releases what was created so far if construction fails
struct PartialSurface<'a> {
    conn: &'a RustConnection,
    resources: CreatedResources,
    armed: bool,
}

impl<'a> PartialSurface<'a> {
    fn new(conn: &'a RustConnection) -> Self {
        Self {
            conn,
            resources: CreatedResources::default(),
            armed: true,
        }
    }

    fn track(&mut self, resource: Resource) {
        self.resources.track(resource);
    }
}

impl Drop for PartialSurface<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for resource in self.resources.teardown_order() {
            if let Err(e) = resource.free(self.conn) {
                error!(resource = ?resource, error = %e, "Failed to free overlay resource after initialization failure");
            }
        }
        let _ = self.conn.flush();
    }
}

#[derive(Debug)]
pub struct OverlaySurface<'a> {
    pub window: Window,
    width: u16,
    height: u16,
    visible: bool,
    colormap: Colormap,
    back_pixmap: Pixmap,
    back_picture: Picture,
    window_picture: Picture,
    gc: Gcontext,
    released: ReleaseOnce,
    conn: &'a RustConnection,
}

impl<'a> OverlaySurface<'a> {
    /// Create a screen-sized surface whose top edge sits `y_offset` pixels above the screen
    pub fn new(conn: &'a RustConnection, screen: &Screen, atoms: &CachedAtoms, y_offset: i32) -> Result<Self> {
        let visual = find_argb_visual(screen).ok_or_else(|| {
            anyhow!("No 32-bit TrueColor visual available. A compositing manager is required for transparency.")
        })?;
        let (width, height) = (screen.width_in_pixels, screen.height_in_pixels);

        let mut partial = PartialSurface::new(conn);

        let colormap = conn.generate_id().context("Failed to generate colormap ID")?;
        conn.create_colormap(ColormapAlloc::NONE, colormap, screen.root, visual)
            .context("Failed to create ARGB colormap for overlay")?;
        partial.track(Resource::Colormap(colormap));

        let window = conn.generate_id().context("Failed to generate X11 window ID")?;
        let y = i16::try_from(-y_offset).context(format!("Overlay y offset {} out of range", y_offset))?;
        conn.create_window(
            x11::ARGB_DEPTH,
            window,
            screen.root,
            0,
            y,
            width,
            height,
            0,
            WindowClass::INPUT_OUTPUT,
            visual,
            &CreateWindowAux::new()
                .background_pixel(0)
                .border_pixel(0)
                .colormap(colormap)
                .override_redirect(x11::OVERRIDE_REDIRECT)
                .event_mask(EventMask::EXPOSURE),
        )
        .context("Failed to create overlay window")?;
        partial.track(Resource::Window(window));

        conn.change_property8(PropMode::REPLACE, window, atoms.wm_class, AtomEnum::STRING, x11::OVERLAY_WM_CLASS)
            .context("Failed to set WM_CLASS for overlay")?;
        conn.change_property32(
            PropMode::REPLACE,
            window,
            atoms.net_wm_state,
            AtomEnum::ATOM,
            &[atoms.net_wm_state_above],
        )
        .context("Failed to set overlay always-on-top")?;

        Self::make_click_through(conn, window)?;

        let back_pixmap = conn.generate_id().context("Failed to generate ID for back pixmap")?;
        conn.create_pixmap(x11::ARGB_DEPTH, back_pixmap, window, width, height)
            .context("Failed to create overlay back pixmap")?;
        partial.track(Resource::Pixmap(back_pixmap));

        let format = get_pictformat(conn, x11::ARGB_DEPTH, true).context("Failed to get ARGB picture format for overlay")?;
        let back_picture = conn.generate_id().context("Failed to generate ID for back picture")?;
        conn.render_create_picture(back_picture, back_pixmap, format, &CreatePictureAux::new())
            .context("Failed to create back picture")?;
        partial.track(Resource::Picture(back_picture));
        let window_picture = conn.generate_id().context("Failed to generate ID for window picture")?;
        conn.render_create_picture(window_picture, window, format, &CreatePictureAux::new())
            .context("Failed to create window picture")?;
        partial.track(Resource::Picture(window_picture));

        let gc = conn.generate_id().context("Failed to generate ID for graphics context")?;
        conn.create_gc(gc, back_pixmap, &CreateGCAux::new())
            .context("Failed to create graphics context for overlay")?;
        partial.track(Resource::Gc(gc));

        // Start from a fully transparent frame
        conn.render_composite(PictOp::CLEAR, back_picture, 0u32, back_picture, 0, 0, 0, 0, 0, 0, width, height)
            .context("Failed to clear back pixmap")?;

        conn.map_window(window).context("Failed to map overlay window")?;
        conn.configure_window(window, &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE))
            .context("Failed to raise overlay window")?;
        conn.flush().context("Failed to flush X11 connection after creating overlay")?;

        partial.armed = false;
        info!(window = window, width = width, height = height, y = y, "Created overlay surface");

        Ok(Self {
            window,
            width,
            height,
            visible: true,
            colormap,
            back_pixmap,
            back_picture,
            window_picture,
            gc,
            released: ReleaseOnce::new(),
            conn,
        })
    }

    /// Empty input shape: pointer events pass through to the windows below
    fn make_click_through(conn: &RustConnection, window: Window) -> Result<()> {
        conn.xfixes_query_version(5, 0)
            .context("Failed to query XFixes version")?
            .reply()
            .context("XFixes extension unavailable")?;
        let region = conn.generate_id().context("Failed to generate ID for input region")?;
        conn.xfixes_create_region(region, &[])
            .context("Failed to create empty input region")?;
        conn.xfixes_set_window_shape_region(window, SK::INPUT, 0, 0, region)
            .context("Failed to set overlay input shape")?;
        conn.xfixes_destroy_region(region).context("Failed to destroy input region")?;
        Ok(())
    }

    /// Copy the back pixmap to the window (after Expose or a new frame)
    pub fn redraw(&self) -> Result<()> {
        self.conn
            .render_composite(
                PictOp::SRC,
                self.back_picture,
                0u32,
                self.window_picture,
                0,
                0,
                0,
                0,
                0,
                0,
                self.width,
                self.height,
            )
            .context("Failed to composite overlay frame onto window")?;
        self.conn.flush().context("Failed to flush X11 connection after redraw")?;
        Ok(())
    }

    /// Free every server-side resource once; later calls do nothing
    pub fn release(&mut self) {
        if !self.released.claim() {
            return;
        }
        if let Err(e) = self.conn.free_gc(self.gc) {
            error!(gc = self.gc, error = %e, "Failed to free GC");
        }
        if let Err(e) = self.conn.render_free_picture(self.window_picture) {
            error!(picture = self.window_picture, error = %e, "Failed to free window picture");
        }
        if let Err(e) = self.conn.render_free_picture(self.back_picture) {
            error!(picture = self.back_picture, error = %e, "Failed to free back picture");
        }
        if let Err(e) = self.conn.free_pixmap(self.back_pixmap) {
            error!(pixmap = self.back_pixmap, error = %e, "Failed to free back pixmap");
        }
        if let Err(e) = self.conn.destroy_window(self.window) {
            error!(window = self.window, error = %e, "Failed to destroy overlay window");
        }
        if let Err(e) = self.conn.free_colormap(self.colormap) {
            error!(colormap = self.colormap, error = %e, "Failed to free colormap");
        }
        if let Err(e) = self.conn.flush() {
            error!(error = %e, "Failed to flush X11 connection during cleanup");
        }
        info!(window = self.window, "Released overlay surface");
    }
}

impl OverlayDisplay for OverlaySurface<'_> {
    fn size(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }

    fn present(&mut self, frame: &Raster) -> Result<()> {
        if frame.width != self.width as u32 || frame.height != self.height as u32 {
            anyhow::bail!(
                "Frame size {}x{} does not match surface {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }

        let bytes = frame.to_le_bytes();
        let row_bytes = self.width as usize * x11::ARGB_BYTES_PER_PIXEL;
        let rows = rows_per_request(self.conn.maximum_request_bytes(), frame.width);

        for (chunk_index, chunk) in bytes.chunks(rows * row_bytes).enumerate() {
            let y = chunk_index * rows;
            let chunk_rows = chunk.len() / row_bytes;
            self.conn
                .put_image(
                    ImageFormat::Z_PIXMAP,
                    self.back_pixmap,
                    self.gc,
                    self.width,
                    chunk_rows as u16,
                    0,
                    y as i16,
                    0,
                    x11::ARGB_DEPTH,
                    chunk,
                )
                .context(format!("Failed to upload overlay rows {}..{}", y, y + chunk_rows))?;
        }
        debug!(rows_per_request = rows, "Uploaded overlay frame");
        self.redraw()
    }

    fn set_visible(&mut self, visible: bool) -> Result<()> {
        if visible == self.visible {
            return Ok(());
        }
        if visible {
            self.conn.map_window(self.window).context("Failed to map overlay window")?;
            self.conn
                .configure_window(self.window, &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE))
                .context("Failed to raise overlay window")?;
        } else {
            self.conn.unmap_window(self.window).context("Failed to unmap overlay window")?;
        }
        self.conn.flush().context("Failed to flush X11 connection after visibility change")?;
        self.visible = visible;
        Ok(())
    }
}

impl Drop for OverlaySurface<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_per_request() {
        // 256 KiB request limit, 1920 px rows of 7680 bytes
        assert_eq!(rows_per_request(262_144, 1920), (262_144 - 64) / 7680);
        // A single row wider than the limit still makes progress
        assert_eq!(rows_per_request(1000, 1920), 1);
        assert_eq!(rows_per_request(0, 0), 1);
    }

    #[test]
    fn test_failed_construction_frees_pictures_and_gc() {
        let mut resources = CreatedResources::default();
        resources.track(Resource::Colormap(1));
        resources.track(Resource::Window(2));
        resources.track(Resource::Pixmap(3));
        resources.track(Resource::Picture(4));
        resources.track(Resource::Picture(5));
        resources.track(Resource::Gc(6));

        let order: Vec<Resource> = resources.teardown_order().collect();
        assert_eq!(
            order,
            vec![
                Resource::Gc(6),
                Resource::Picture(5),
                Resource::Picture(4),
                Resource::Pixmap(3),
                Resource::Window(2),
                Resource::Colormap(1),
            ]
        );
    }

    #[test]
    fn test_early_failure_frees_only_what_exists() {
        let mut resources = CreatedResources::default();
        resources.track(Resource::Colormap(1));
        let order: Vec<Resource> = resources.teardown_order().collect();
        assert_eq!(order, vec![Resource::Colormap(1)]);
    }
}
