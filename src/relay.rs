//! Host event relay
//!
//! Turns host window events into protocol events for the client.

use tracing::debug;

use crate::host::{Host, HostEvent, HostEventKind};
use crate::protocol::Message;
use crate::windows::WindowManager;

/// Handles one host event. Returns the message to send to the client, if
/// any. Events for windows that are no longer registered are dropped.
pub fn relay<H: Host>(windows: &mut WindowManager<H>, event: HostEvent) -> Option<Message> {
    match event.kind {
        HostEventKind::Closed => match windows.id_for_handle(event.handle) {
            Some(id) => {
                debug!(id, "user closed window");
                Some(Message::CloseWindowEvent { id })
            }
            None => {
                debug!(handle = ?event.handle, "close for unregistered window dropped");
                None
            }
        },
        HostEventKind::NeedsRedraw => {
            if !windows.redraw_by_handle(event.handle) {
                debug!(handle = ?event.handle, "redraw for unregistered window dropped");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostCall, HostHandle};
    use crate::windows::tests::{manager, request};

    #[test]
    fn user_close_becomes_event() {
        let (mut wm, probe, mut rx) = manager(1 << 20);
        wm.open(&request(5, 100, 60, "w"));
        let handle = wm.registry().find_by_id(5).unwrap().handle;

        assert!(probe.user_close(handle));
        let event = rx.try_recv().unwrap();
        assert_eq!(relay(&mut wm, event), Some(Message::CloseWindowEvent { id: 5 }));
        // the client decides when the window goes away
        assert_eq!(wm.registry().len(), 1);
    }

    #[test]
    fn redraw_reblits_without_reply() {
        let (mut wm, probe, mut rx) = manager(1 << 20);
        wm.open(&request(5, 100, 60, "w"));
        let handle = wm.registry().find_by_id(5).unwrap().handle;

        assert!(probe.damage(handle));
        let event = rx.try_recv().unwrap();
        assert_eq!(relay(&mut wm, event), None);
        assert_eq!(probe.calls().last(), Some(&HostCall::Blit(handle)));
    }

    #[test]
    fn stale_events_are_dropped() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        let calls = probe.calls();
        for kind in [HostEventKind::Closed, HostEventKind::NeedsRedraw] {
            let event = HostEvent {
                handle: HostHandle(77),
                kind,
            };
            assert_eq!(relay(&mut wm, event), None);
        }
        assert_eq!(probe.calls(), calls);
    }
}
