//! Window protocol frames
//!
//! One frame per message, at most 255 bytes, byte 0 is the command code.
//! Multi-byte fields use the native byte order of the machine that wrote
//! them; both ends of the link must agree on it.

use thiserror::Error;

pub const MAX_FRAME: usize = 255;

/// Bytes reserved for a window title.
pub const TITLE_CAPACITY: usize = 128;

pub const REQ_OPEN_WINDOW: u8 = 1;
pub const REQ_CLOSE_WINDOW: u8 = 2;
pub const REQ_FLIP_BUFFER: u8 = 3;
pub const RES_OPEN_WINDOW_FAIL: u8 = 4;
pub const RES_OPEN_WINDOW_SUCCESS: u8 = 5;
pub const EVENT_CLOSE_WINDOW: u8 = 6;

const OPEN_HEADER: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    #[error("command {code} needs {needed} bytes, frame has {len}")]
    Truncated { code: u8, needed: usize, len: usize },
    #[error("title of {len} bytes exceeds {}", TITLE_CAPACITY)]
    TitleTooLong { len: usize },
}

/// Window title, at most [`TITLE_CAPACITY`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Title(String);

impl Title {
    /// Takes the bytes up to the first NUL. Oversized titles are refused
    /// rather than cut.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecodeError> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        if end > TITLE_CAPACITY {
            return Err(DecodeError::TitleTooLong { len: end });
        }
        Ok(Self(String::from_utf8_lossy(&raw[..end]).into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenWindow {
    pub id: u8,
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
    pub title: Title,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    OpenWindowRequest(OpenWindow),
    CloseWindowRequest { id: u8 },
    FlipBufferRequest { id: u8 },
    OpenWindowFail { id: u8 },
    OpenWindowSuccess {
        id: u8,
        buffer_addr: u32,
        width: u16,
        height: u16,
        depth: u16,
    },
    CloseWindowEvent { id: u8 },
}

fn u16_at(frame: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([frame[at], frame[at + 1]])
}

fn require(frame: &[u8], needed: usize) -> Result<(), DecodeError> {
    if frame.len() < needed {
        return Err(DecodeError::Truncated {
            code: frame[0],
            needed,
            len: frame.len(),
        });
    }
    Ok(())
}

impl Message {
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let code = *frame.first().ok_or(DecodeError::Empty)?;
        let msg = match code {
            REQ_OPEN_WINDOW => {
                require(frame, OPEN_HEADER)?;
                Self::OpenWindowRequest(OpenWindow {
                    id: frame[1],
                    left: u16_at(frame, 2),
                    top: u16_at(frame, 4),
                    width: u16_at(frame, 6),
                    height: u16_at(frame, 8),
                    title: Title::from_bytes(&frame[OPEN_HEADER..])?,
                })
            }
            REQ_CLOSE_WINDOW => {
                require(frame, 2)?;
                Self::CloseWindowRequest { id: frame[1] }
            }
            REQ_FLIP_BUFFER => {
                require(frame, 2)?;
                Self::FlipBufferRequest { id: frame[1] }
            }
            RES_OPEN_WINDOW_FAIL => {
                require(frame, 2)?;
                Self::OpenWindowFail { id: frame[1] }
            }
            RES_OPEN_WINDOW_SUCCESS => {
                require(frame, 12)?;
                Self::OpenWindowSuccess {
                    id: frame[1],
                    buffer_addr: u32::from_ne_bytes([frame[2], frame[3], frame[4], frame[5]]),
                    width: u16_at(frame, 6),
                    height: u16_at(frame, 8),
                    depth: u16_at(frame, 10),
                }
            }
            EVENT_CLOSE_WINDOW => {
                require(frame, 2)?;
                Self::CloseWindowEvent { id: frame[1] }
            }
            other => return Err(DecodeError::UnknownCommand(other)),
        };
        Ok(msg)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::OpenWindowRequest(req) => {
                let title = req.title.as_str().as_bytes();
                let mut frame = Vec::with_capacity(OPEN_HEADER + title.len());
                frame.push(REQ_OPEN_WINDOW);
                frame.push(req.id);
                frame.extend_from_slice(&req.left.to_ne_bytes());
                frame.extend_from_slice(&req.top.to_ne_bytes());
                frame.extend_from_slice(&req.width.to_ne_bytes());
                frame.extend_from_slice(&req.height.to_ne_bytes());
                frame.extend_from_slice(title);
                frame
            }
            Self::CloseWindowRequest { id } => vec![REQ_CLOSE_WINDOW, *id],
            Self::FlipBufferRequest { id } => vec![REQ_FLIP_BUFFER, *id],
            Self::OpenWindowFail { id } => vec![RES_OPEN_WINDOW_FAIL, *id],
            Self::OpenWindowSuccess {
                id,
                buffer_addr,
                width,
                height,
                depth,
            } => {
                let mut frame = Vec::with_capacity(12);
                frame.push(RES_OPEN_WINDOW_SUCCESS);
                frame.push(*id);
                frame.extend_from_slice(&buffer_addr.to_ne_bytes());
                frame.extend_from_slice(&width.to_ne_bytes());
                frame.extend_from_slice(&height.to_ne_bytes());
                frame.extend_from_slice(&depth.to_ne_bytes());
                frame
            }
            Self::CloseWindowEvent { id } => vec![EVENT_CLOSE_WINDOW, *id],
        }
    }
}
