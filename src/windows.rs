//! Window lifecycle
//!
//! Opens, flips and closes host windows on behalf of the remote client. Each
//! open window owns one planar buffer in the shared arena; the client draws
//! into it directly and asks for a flip to have it shown.

use tracing::{debug, info, warn};

use crate::arena::SharedArena;
use crate::host::{Host, HostHandle, Rect};
use crate::planar::{PlaneLayout, MAX_DEPTH};
use crate::protocol::{Message, OpenWindow};
use crate::registry::{WindowRecord, WindowRegistry};

pub struct WindowManager<H> {
    registry: WindowRegistry,
    arena: SharedArena,
    host: H,
}

impl<H: Host> WindowManager<H> {
    pub fn new(host: H, arena: SharedArena) -> Self {
        Self {
            registry: WindowRegistry::new(),
            arena,
            host,
        }
    }

    /// Handles an open request and builds the reply for it. Nothing is left
    /// behind when the reply is a failure.
    pub fn open(&mut self, req: &OpenWindow) -> Message {
        let id = req.id;
        let fail = Message::OpenWindowFail { id };
        if self.registry.contains_id(id) {
            warn!(id, "window id already in use");
            return fail;
        }

        let rect = Rect {
            left: req.left,
            top: req.top,
            width: req.width,
            height: req.height,
        };
        let Some(handle) = self.host.open_window(rect, req.title.as_str()) else {
            warn!(id, ?rect, "host refused window");
            return fail;
        };
        let realized = match self.host.realized(handle) {
            Some(r) if (1..=MAX_DEPTH).contains(&r.depth) && r.width > 0 && r.height > 0 => r,
            other => {
                warn!(id, ?other, "unusable drawing area");
                self.host.close_window(handle);
                return fail;
            }
        };

        let layout = PlaneLayout::new(realized.width, realized.height, realized.depth);
        let buffer = match self.arena.alloc(layout.total_len()) {
            Ok(buffer) => buffer,
            Err(error) => {
                warn!(id, %error, "no buffer for window");
                self.host.close_window(handle);
                return fail;
            }
        };
        let buffer_addr = match self.arena.translate(&buffer) {
            Ok(addr) => addr,
            Err(error) => {
                warn!(id, %error, "buffer not reachable by peer");
                self.arena.release(buffer);
                self.host.close_window(handle);
                return fail;
            }
        };

        debug!(id, offset = buffer.offset(), len = buffer.len(), "buffer allocated");

        self.host.subscribe(handle);
        let record = WindowRecord {
            id,
            handle,
            buffer,
            layout,
            title: req.title.clone(),
        };
        if let Err(record) = self.registry.insert(record) {
            warn!(id, ?handle, "host handle already registered");
            self.destroy(record);
            return fail;
        }

        info!(
            id,
            title = req.title.as_str(),
            width = realized.width,
            height = realized.height,
            depth = realized.depth,
            open = self.registry.len(),
            addr = format_args!("{buffer_addr:#010x}"),
            "window opened"
        );
        Message::OpenWindowSuccess {
            id,
            buffer_addr,
            width: realized.width,
            height: realized.height,
            depth: u16::from(realized.depth),
        }
    }

    /// Closes window `id`. Returns `false` when no such window is open.
    pub fn close(&mut self, id: u8) -> bool {
        let Some(record) = self.registry.remove_by_id(id) else {
            debug!(id, "close for unknown window");
            return false;
        };
        info!(id, title = record.title.as_str(), "window closed");
        self.destroy(record);
        true
    }

    /// Shows the current buffer contents of window `id`.
    pub fn flip(&mut self, id: u8) -> bool {
        let Some(record) = self.registry.find_by_id(id) else {
            debug!(id, "flip for unknown window");
            return false;
        };
        redraw(&mut self.host, &self.arena, record);
        true
    }

    pub fn id_for_handle(&self, handle: HostHandle) -> Option<u8> {
        self.registry.find_by_handle(handle).map(|r| r.id)
    }

    /// Re-blits the window behind `handle`, if it is still ours.
    pub fn redraw_by_handle(&mut self, handle: HostHandle) -> bool {
        let Some(record) = self.registry.find_by_handle(handle) else {
            return false;
        };
        redraw(&mut self.host, &self.arena, record);
        true
    }

    /// Closes every remaining window. Returns how many there were.
    pub fn teardown(&mut self) -> usize {
        if self.registry.is_empty() {
            return 0;
        }
        let records = self.registry.drain();
        let count = records.len();
        for record in records {
            debug!(id = record.id, "closing window at teardown");
            self.destroy(record);
        }
        count
    }

    fn destroy(&mut self, record: WindowRecord) {
        self.host.unsubscribe(record.handle);
        self.host.close_window(record.handle);
        self.arena.release(record.buffer);
    }

    pub fn registry(&self) -> &WindowRegistry {
        &self.registry
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Window memory as the peer would write it.
    #[cfg(test)]
    pub fn buffer_mut(&mut self, id: u8) -> Option<&mut [u8]> {
        let record = self.registry.find_by_id(id)?;
        Some(self.arena.bytes_mut(&record.buffer))
    }
}

fn redraw<H: Host>(host: &mut H, arena: &SharedArena, record: &WindowRecord) {
    host.blit(record.handle, arena.bytes(&record.buffer), &record.layout);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::{HeadlessConfig, HeadlessHost, HeadlessProbe, HostCall, HostEvent};
    use crate::protocol::Title;
    use tokio::sync::mpsc;

    pub(crate) const BASE: u32 = 0x0020_0000;

    pub(crate) fn manager(
        arena_size: usize,
    ) -> (WindowManager<HeadlessHost>, HeadlessProbe, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = HeadlessHost::new(HeadlessConfig::default());
        let probe = host.probe(tx);
        let arena = SharedArena::anonymous(arena_size, BASE).unwrap();
        (WindowManager::new(host, arena), probe, rx)
    }

    pub(crate) fn request(id: u8, width: u16, height: u16, title: &str) -> OpenWindow {
        OpenWindow {
            id,
            left: 8,
            top: 8,
            width,
            height,
            title: Title::from_bytes(title.as_bytes()).unwrap(),
        }
    }

    #[test]
    fn open_replies_with_realized_geometry() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        let reply = wm.open(&request(4, 320, 200, "boing"));
        // borders take 22 x 13
        assert_eq!(
            reply,
            Message::OpenWindowSuccess {
                id: 4,
                buffer_addr: BASE,
                width: 298,
                height: 187,
                depth: 3
            }
        );

        let record = wm.registry().find_by_id(4).unwrap();
        assert_eq!(record.layout.bytes_per_row(), 38);
        assert!(record.buffer.len() >= 38 * 187 * 3);
        assert_eq!(probe.title(record.handle).as_deref(), Some("boing"));
        assert!(probe.is_subscribed(record.handle));
    }

    #[test]
    fn distinct_ids_get_one_record_each() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        for id in [1, 7, 3] {
            assert!(matches!(wm.open(&request(id, 100, 60, "w")), Message::OpenWindowSuccess { .. }));
        }
        assert_eq!(wm.open(&request(7, 100, 60, "again")), Message::OpenWindowFail { id: 7 });

        assert_eq!(wm.registry().iter().map(|r| r.id).collect::<Vec<_>>(), [1, 3, 7]);
        assert_eq!(probe.handles().len(), 3);
    }

    #[test]
    fn close_unknown_id_changes_nothing() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        wm.open(&request(1, 100, 60, "w"));
        let free = wm.arena().free_bytes();
        let calls = probe.calls().len();

        assert!(!wm.close(2));
        assert_eq!(wm.registry().len(), 1);
        assert_eq!(wm.arena().free_bytes(), free);
        assert_eq!(probe.calls().len(), calls);
    }

    #[test]
    fn close_releases_everything() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        wm.open(&request(1, 100, 60, "a"));
        wm.open(&request(2, 100, 60, "b"));
        let handle = wm.registry().find_by_id(1).unwrap().handle;
        let held = wm.registry().find_by_id(1).unwrap().buffer.len();
        let free = wm.arena().free_bytes();

        assert!(wm.close(1));
        assert!(wm.registry().find_by_id(1).is_none());
        assert!(wm.id_for_handle(handle).is_none());
        assert_eq!(wm.arena().free_bytes(), free + held);
        assert!(!probe.handles().contains(&handle));
        assert_eq!(wm.registry().len(), 1);
    }

    #[test]
    fn flip_shows_buffer_contents() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        wm.open(&request(1, 54, 23, "w"));
        // 32 x 10 usable at depth 3
        let record = wm.registry().find_by_id(1).unwrap();
        let (handle, layout) = (record.handle, record.layout);
        assert_eq!((layout.width, layout.height), (32, 10));

        let mut chunky = vec![0u8; 32 * 10];
        chunky[0] = 6;
        chunky[33] = 1;
        let mut planar = vec![0u8; layout.total_len()];
        layout.convert_chunky(&chunky, &mut planar).unwrap();
        wm.buffer_mut(1).unwrap()[..planar.len()].copy_from_slice(&planar);

        assert!(wm.flip(1));
        let image = probe.image(handle).unwrap();
        assert_eq!(image[0], 6);
        assert_eq!(image[33], 1);
        assert_eq!(image.iter().filter(|&&p| p != 0).count(), 2);
    }

    #[test]
    fn flip_unknown_id_touches_nothing() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        wm.open(&request(1, 100, 60, "w"));
        let calls = probe.calls();
        assert!(!wm.flip(9));
        assert_eq!(probe.calls(), calls);
    }

    #[test]
    fn host_refusal_fails_cleanly() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        probe.refuse_opens(true);
        assert_eq!(wm.open(&request(1, 100, 60, "w")), Message::OpenWindowFail { id: 1 });
        assert!(wm.registry().is_empty());
        assert_eq!(wm.arena().free_bytes(), wm.arena().capacity());
    }

    #[test]
    fn exhausted_arena_closes_host_window() {
        let (mut wm, probe, _rx) = manager(1024);
        assert_eq!(wm.open(&request(1, 320, 200, "w")), Message::OpenWindowFail { id: 1 });
        assert!(wm.registry().is_empty());
        assert!(probe.handles().is_empty());
        assert!(matches!(probe.calls()[..], [HostCall::Open(h), HostCall::Close(c)] if h == c));
    }

    #[test]
    fn teardown_closes_all() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        wm.open(&request(1, 100, 60, "a"));
        wm.open(&request(2, 100, 60, "b"));
        assert_eq!(wm.teardown(), 2);
        assert!(wm.registry().is_empty());
        assert!(probe.handles().is_empty());
        assert_eq!(wm.arena().free_bytes(), wm.arena().capacity());
        assert_eq!(wm.teardown(), 0);
    }
}
