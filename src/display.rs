//! Native windows with minifb rendering
//!
//! Every client window becomes one OS window. Planar buffers are decoded to
//! palette indices and shown through a fixed grayscale ramp, since the
//! client never uploads a palette.

use std::collections::BTreeMap;

use minifb::{Key, Window, WindowOptions};
use tracing::{debug, warn};

use crate::host::{EventPort, Host, HostEvent, HostEventKind, HostHandle, Realized, Rect};
use crate::planar::{planar_to_chunky, PlaneLayout};

/// Largest width or height handed out for a window.
pub const MAX_EXTENT: u16 = 2048;

struct DisplayWindow {
    window: Window,
    realized: Realized,
    /// 0RGB, what minifb wants
    framebuffer: Vec<u32>,
    size: (usize, usize),
    subscribed: bool,
    closed_reported: bool,
}

impl DisplayWindow {
    fn present(&mut self) {
        let (w, h) = (usize::from(self.realized.width), usize::from(self.realized.height));
        if let Err(error) = self.window.update_with_buffer(&self.framebuffer, w, h) {
            debug!(%error, "present failed");
        }
    }
}

pub struct DisplayHost {
    depth: u8,
    palette: [u32; 256],
    next_handle: u32,
    windows: BTreeMap<HostHandle, DisplayWindow>,
    events: EventPort,
    chunky: Vec<u8>,
}

impl DisplayHost {
    pub fn new(events: EventPort, depth: u8) -> Self {
        Self {
            depth,
            palette: gray_palette(depth),
            next_handle: 1,
            windows: BTreeMap::new(),
            events,
            chunky: Vec::new(),
        }
    }

    fn emit(&self, handle: HostHandle, kind: HostEventKind) {
        let _ = self.events.send(HostEvent { handle, kind });
    }
}

/// Index `i` of a `depth`-bit image as an even step between black and white.
fn gray_palette(depth: u8) -> [u32; 256] {
    let max = (1u32 << depth.clamp(1, 8)) - 1;
    let mut palette = [0u32; 256];
    for (i, entry) in palette.iter_mut().enumerate() {
        let v = (i as u32).min(max) * 255 / max;
        *entry = (v << 16) | (v << 8) | v;
    }
    palette
}

impl Host for DisplayHost {
    fn open_window(&mut self, rect: Rect, title: &str) -> Option<HostHandle> {
        let width = rect.width.clamp(1, MAX_EXTENT);
        let height = rect.height.clamp(1, MAX_EXTENT);
        let mut window = match Window::new(
            title,
            usize::from(width),
            usize::from(height),
            WindowOptions {
                resize: false,
                ..Default::default()
            },
        ) {
            Ok(window) => window,
            Err(error) => {
                warn!(%error, "failed to create window");
                return None;
            }
        };
        window.set_position(rect.left as isize, rect.top as isize);
        // pacing comes from the agent's pump
        window.set_target_fps(0);

        let handle = HostHandle(self.next_handle);
        self.next_handle += 1;
        let size = (usize::from(width), usize::from(height));
        let mut entry = DisplayWindow {
            window,
            realized: Realized {
                width,
                height,
                depth: self.depth,
            },
            framebuffer: vec![0; size.0 * size.1],
            size,
            subscribed: false,
            closed_reported: false,
        };
        entry.present();
        self.windows.insert(handle, entry);
        Some(handle)
    }

    fn realized(&self, handle: HostHandle) -> Option<Realized> {
        self.windows.get(&handle).map(|w| w.realized)
    }

    fn close_window(&mut self, handle: HostHandle) {
        // dropping the minifb window closes it
        self.windows.remove(&handle);
    }

    fn blit(&mut self, handle: HostHandle, bitmap: &[u8], layout: &PlaneLayout) {
        let Some(entry) = self.windows.get_mut(&handle) else {
            return;
        };
        let pixels = usize::from(layout.width) * usize::from(layout.height);
        self.chunky.resize(pixels, 0);
        if let Err(error) = planar_to_chunky(bitmap, layout, &mut self.chunky) {
            debug!(%error, "blit skipped");
            return;
        }
        for (dst, &index) in entry.framebuffer.iter_mut().zip(&self.chunky) {
            *dst = self.palette[usize::from(index)];
        }
        entry.present();
    }

    fn subscribe(&mut self, handle: HostHandle) {
        if let Some(w) = self.windows.get_mut(&handle) {
            w.subscribed = true;
        }
    }

    fn unsubscribe(&mut self, handle: HostHandle) {
        if let Some(w) = self.windows.get_mut(&handle) {
            w.subscribed = false;
        }
    }

    /// Services window input. Windows closed by the user (or by Escape) are
    /// reported once; a changed window size asks for a redraw.
    fn pump(&mut self) {
        let mut raised = Vec::new();
        for (&handle, entry) in &mut self.windows {
            if entry.closed_reported {
                continue;
            }
            if !entry.window.is_open() || entry.window.is_key_down(Key::Escape) {
                entry.closed_reported = true;
                if entry.subscribed {
                    raised.push((handle, HostEventKind::Closed));
                }
                continue;
            }
            entry.window.update();
            let size = entry.window.get_size();
            if size != entry.size {
                entry.size = size;
                if entry.subscribed {
                    raised.push((handle, HostEventKind::NeedsRedraw));
                }
            }
        }
        for (handle, kind) in raised {
            self.emit(handle, kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_spans_black_to_white() {
        let one = gray_palette(1);
        assert_eq!(&one[..2], &[0, 0xff_ff_ff]);

        let three = gray_palette(3);
        assert_eq!(three[0], 0);
        assert_eq!(three[7], 0xff_ff_ff);
        // 3 * 255 / 7
        assert_eq!(three[3], 0x6d_6d_6d);
        // indices past the depth saturate
        assert_eq!(three[200], 0xff_ff_ff);

        assert_eq!(gray_palette(8)[128], 0x80_80_80);
    }
}
