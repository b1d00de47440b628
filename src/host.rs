//! Host windowing subsystem
//!
//! The agent drives real windows through [`Host`]. Window events are pushed
//! onto the [`EventPort`] the host was built with, and only for windows that
//! have been subscribed.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::planar::{planar_to_chunky, PlaneLayout};

/// Opaque host window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
}

/// Usable drawing area of an opened window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Realized {
    pub width: u16,
    pub height: u16,
    pub depth: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEventKind {
    Closed,
    NeedsRedraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent {
    pub handle: HostHandle,
    pub kind: HostEventKind,
}

pub type EventPort = mpsc::UnboundedSender<HostEvent>;

pub trait Host {
    /// `None` when the host cannot materialise the window.
    fn open_window(&mut self, rect: Rect, title: &str) -> Option<HostHandle>;

    /// Drawing area actually granted; may differ from the requested size.
    fn realized(&self, handle: HostHandle) -> Option<Realized>;

    fn close_window(&mut self, handle: HostHandle);

    /// Copies a whole planar bitmap into the window's drawing area.
    fn blit(&mut self, handle: HostHandle, bitmap: &[u8], layout: &PlaneLayout);

    fn subscribe(&mut self, handle: HostHandle);

    fn unsubscribe(&mut self, handle: HostHandle);

    /// Gives the host a chance to process its own input. Called periodically.
    fn pump(&mut self) {}
}

/// Frame the headless screen puts around each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Borders {
    pub left: u16,
    pub right: u16,
    pub top: u16,
    pub bottom: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct HeadlessConfig {
    pub screen_width: u16,
    pub screen_height: u16,
    pub depth: u8,
    pub borders: Borders,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            screen_width: 640,
            screen_height: 512,
            depth: 3,
            borders: Borders {
                left: 4,
                right: 18,
                top: 11,
                bottom: 2,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    Open(HostHandle),
    Close(HostHandle),
    Blit(HostHandle),
}

#[derive(Debug)]
struct HeadlessWindow {
    title: String,
    realized: Realized,
    subscribed: bool,
    /// Last blitted image, one index per pixel.
    image: Vec<u8>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_handle: u32,
    windows: BTreeMap<HostHandle, HeadlessWindow>,
    refuse_opens: bool,
    calls: Vec<HostCall>,
}

/// In-memory screen. Stands in for a display on machines without one; it
/// has no user of its own, so it never raises events by itself.
pub struct HeadlessHost {
    config: HeadlessConfig,
    state: Rc<RefCell<HeadlessState>>,
}

impl HeadlessHost {
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            state: Rc::new(RefCell::new(HeadlessState {
                next_handle: 1,
                ..Default::default()
            })),
        }
    }

    /// Handle for inspecting the screen and playing its user, raising
    /// events on `events`.
    #[cfg(test)]
    pub fn probe(&self, events: EventPort) -> HeadlessProbe {
        HeadlessProbe {
            state: Rc::clone(&self.state),
            events,
        }
    }
}

impl Host for HeadlessHost {
    fn open_window(&mut self, rect: Rect, title: &str) -> Option<HostHandle> {
        let mut state = self.state.borrow_mut();
        if state.refuse_opens {
            return None;
        }
        let b = self.config.borders;
        let width = rect.width.min(self.config.screen_width);
        let height = rect.height.min(self.config.screen_height);
        if width <= b.left + b.right || height <= b.top + b.bottom {
            debug!(width, height, "window too small for its borders");
            return None;
        }

        let handle = HostHandle(state.next_handle);
        state.next_handle += 1;
        let realized = Realized {
            width: width - b.left - b.right,
            height: height - b.top - b.bottom,
            depth: self.config.depth,
        };
        state.windows.insert(
            handle,
            HeadlessWindow {
                title: title.to_owned(),
                realized,
                subscribed: false,
                image: vec![0; usize::from(realized.width) * usize::from(realized.height)],
            },
        );
        state.calls.push(HostCall::Open(handle));
        Some(handle)
    }

    fn realized(&self, handle: HostHandle) -> Option<Realized> {
        self.state.borrow().windows.get(&handle).map(|w| w.realized)
    }

    fn close_window(&mut self, handle: HostHandle) {
        let mut state = self.state.borrow_mut();
        if let Some(window) = state.windows.remove(&handle) {
            debug!(?handle, title = %window.title, subscribed = window.subscribed, "headless window closed");
        }
        state.calls.push(HostCall::Close(handle));
    }

    fn blit(&mut self, handle: HostHandle, bitmap: &[u8], layout: &PlaneLayout) {
        let mut state = self.state.borrow_mut();
        state.calls.push(HostCall::Blit(handle));
        let Some(window) = state.windows.get_mut(&handle) else {
            return;
        };
        if let Err(error) = planar_to_chunky(bitmap, layout, &mut window.image) {
            debug!(%error, "blit skipped");
        }
    }

    fn subscribe(&mut self, handle: HostHandle) {
        if let Some(w) = self.state.borrow_mut().windows.get_mut(&handle) {
            w.subscribed = true;
        }
    }

    fn unsubscribe(&mut self, handle: HostHandle) {
        if let Some(w) = self.state.borrow_mut().windows.get_mut(&handle) {
            w.subscribed = false;
        }
    }
}

/// Inspection and event injection for a [`HeadlessHost`].
#[cfg(test)]
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Rc<RefCell<HeadlessState>>,
    events: EventPort,
}

#[cfg(test)]
impl HeadlessProbe {
    fn emit(&self, handle: HostHandle, kind: HostEventKind) -> bool {
        let subscribed = self
            .state
            .borrow()
            .windows
            .get(&handle)
            .is_some_and(|w| w.subscribed);
        if subscribed {
            let _ = self.events.send(HostEvent { handle, kind });
        }
        subscribed
    }

    /// Simulates the user hitting the close gadget.
    pub fn user_close(&self, handle: HostHandle) -> bool {
        self.emit(handle, HostEventKind::Closed)
    }

    /// Simulates the window being uncovered.
    pub fn damage(&self, handle: HostHandle) -> bool {
        self.emit(handle, HostEventKind::NeedsRedraw)
    }

    pub fn refuse_opens(&self, refuse: bool) {
        self.state.borrow_mut().refuse_opens = refuse;
    }

    pub fn handles(&self) -> Vec<HostHandle> {
        self.state.borrow().windows.keys().copied().collect()
    }

    pub fn title(&self, handle: HostHandle) -> Option<String> {
        self.state.borrow().windows.get(&handle).map(|w| w.title.clone())
    }

    pub fn image(&self, handle: HostHandle) -> Option<Vec<u8>> {
        self.state.borrow().windows.get(&handle).map(|w| w.image.clone())
    }

    pub fn is_subscribed(&self, handle: HostHandle) -> bool {
        self.state
            .borrow()
            .windows
            .get(&handle)
            .is_some_and(|w| w.subscribed)
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.borrow().calls.clone()
    }
}
