//! Protocol dispatch: one inbound frame in, at most one reply out.

use tracing::{debug, warn};

use crate::host::Host;
use crate::protocol::{DecodeError, Message, REQ_OPEN_WINDOW};
use crate::windows::WindowManager;

pub fn dispatch<H: Host>(windows: &mut WindowManager<H>, frame: &[u8]) -> Option<Message> {
    let msg = match Message::decode(frame) {
        Ok(msg) => msg,
        Err(DecodeError::UnknownCommand(code)) => {
            debug!(code, frame = %hex::encode(frame), "ignoring unknown command");
            return None;
        }
        Err(error) => {
            warn!(%error, "malformed request");
            return malformed_open(frame);
        }
    };

    match msg {
        Message::OpenWindowRequest(req) => Some(windows.open(&req)),
        Message::CloseWindowRequest { id } => {
            windows.close(id);
            None
        }
        Message::FlipBufferRequest { id } => {
            windows.flip(id);
            None
        }
        other => {
            debug!(?other, "ignoring agent-bound message from client");
            None
        }
    }
}

/// A broken open request still names its window; the client gets a failure
/// for it instead of silence.
fn malformed_open(frame: &[u8]) -> Option<Message> {
    match frame {
        [REQ_OPEN_WINDOW, id, ..] => Some(Message::OpenWindowFail { id: *id }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostCall;
    use crate::protocol::{REQ_FLIP_BUFFER, TITLE_CAPACITY};
    use crate::windows::tests::{manager, request};

    fn open_frame(id: u8, title: &[u8]) -> Vec<u8> {
        let mut frame = Message::OpenWindowRequest(request(id, 100, 60, "")).encode();
        frame.extend_from_slice(title);
        frame
    }

    #[test]
    fn open_close_flip_route_to_windows() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        let reply = dispatch(&mut wm, &open_frame(2, b"hello\0"));
        assert!(matches!(reply, Some(Message::OpenWindowSuccess { id: 2, .. })));
        let handle = wm.registry().find_by_id(2).unwrap().handle;

        assert_eq!(dispatch(&mut wm, &Message::FlipBufferRequest { id: 2 }.encode()), None);
        assert_eq!(probe.calls().last(), Some(&HostCall::Blit(handle)));
        assert_eq!(dispatch(&mut wm, &Message::CloseWindowRequest { id: 2 }.encode()), None);
        assert!(wm.registry().is_empty());
    }

    #[test]
    fn unknown_and_agent_bound_codes_are_ignored() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        assert_eq!(dispatch(&mut wm, &[0x7f, 1, 2, 3]), None);
        assert_eq!(dispatch(&mut wm, &Message::CloseWindowEvent { id: 1 }.encode()), None);
        assert_eq!(dispatch(&mut wm, &[]), None);
        assert!(probe.calls().is_empty());
    }

    #[test]
    fn oversized_title_fails_the_open() {
        let (mut wm, probe, _rx) = manager(1 << 20);
        let title = vec![b'a'; TITLE_CAPACITY + 20];
        assert_eq!(dispatch(&mut wm, &open_frame(3, &title)), Some(Message::OpenWindowFail { id: 3 }));
        assert!(wm.registry().is_empty());
        assert!(probe.calls().is_empty());
    }

    #[test]
    fn truncated_open_fails_when_id_is_present() {
        let (mut wm, _probe, _rx) = manager(1 << 20);
        assert_eq!(dispatch(&mut wm, &[REQ_OPEN_WINDOW, 4, 0, 0]), Some(Message::OpenWindowFail { id: 4 }));
        assert_eq!(dispatch(&mut wm, &[REQ_OPEN_WINDOW]), None);
        assert_eq!(dispatch(&mut wm, &[REQ_FLIP_BUFFER]), None);
    }
}
