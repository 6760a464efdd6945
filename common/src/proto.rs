//! Binary wire protocol: one packet per WebSocket message, a big-endian u16
//! command id followed by a command-specific payload.

use bytes::{BufMut, Bytes, BytesMut};
use glam::IVec2;
use thiserror::Error;

/// One prepared server packet. Cloning is a refcount bump, so pushing the
/// same packet to every subscriber costs no copies.
pub type Packet = Bytes;

/// Commands the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ClientCmd {
    Message = 1,
    Announce = 2,
    Ping = 4,
    CursorPos = 100,
    CursorDown = 101,
    CursorUp = 102,
    Boundary = 103,
    ChunksReceived = 104,
    PreviewRequest = 105,
    ToolSize = 200,
    ToolColor = 201,
    ToolType = 202,
    Undo = 203,
}

impl ClientCmd {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => Self::Message,
            2 => Self::Announce,
            4 => Self::Ping,
            100 => Self::CursorPos,
            101 => Self::CursorDown,
            102 => Self::CursorUp,
            103 => Self::Boundary,
            104 => Self::ChunksReceived,
            105 => Self::PreviewRequest,
            200 => Self::ToolSize,
            201 => Self::ToolColor,
            202 => Self::ToolType,
            203 => Self::Undo,
            _ => return None,
        })
    }
}

/// Packets the server sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServerCmd {
    Message = 1,
    YourId = 2,
    Kick = 3,
    ChunkImage = 100,
    ChunkPixelPack = 101,
    ChunkCreate = 110,
    ChunkRemove = 111,
    PreviewImage = 200,
    UserCreate = 1000,
    UserRemove = 1001,
    UserCursorPos = 1002,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Plain = 0,
    Html = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ToolKind {
    #[default]
    Brush = 0,
    Floodfill = 1,
}

impl ToolKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Brush),
            1 => Some(Self::Floodfill),
            _ => None,
        }
    }
}

/// Split an incoming frame into its command id and payload.
pub fn split_frame(frame: &[u8]) -> Option<(u16, &[u8])> {
    if frame.len() < 2 {
        return None;
    }
    Some((u16::from_be_bytes([frame[0], frame[1]]), &frame[2..]))
}

/// A client payload was shorter than its command requires.
#[derive(Debug, Error)]
#[error("truncated payload")]
pub struct Truncated;

/// Bounds-checked big-endian payload reader.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        if self.buf.len() < n {
            return Err(Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, Truncated> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, Truncated> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, Truncated> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, Truncated> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32, Truncated> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn header(cmd: ServerCmd, payload: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + payload);
    buf.put_u16(cmd as u16);
    buf
}

pub fn your_id(id: u16) -> Packet {
    let mut buf = header(ServerCmd::YourId, 2);
    buf.put_u16(id);
    buf.freeze()
}

pub fn kick(reason: &str) -> Packet {
    let mut buf = header(ServerCmd::Kick, reason.len());
    buf.put_slice(reason.as_bytes());
    buf.freeze()
}

pub fn message(kind: MessageKind, text: &str) -> Packet {
    let mut buf = header(ServerCmd::Message, 1 + text.len());
    buf.put_u8(kind as u8);
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

pub fn chunk_image(pos: IVec2, raw_size: u32, lz4: &[u8]) -> Packet {
    let mut buf = header(ServerCmd::ChunkImage, 12 + lz4.len());
    buf.put_i32(pos.x);
    buf.put_i32(pos.y);
    buf.put_u32(raw_size);
    buf.put_slice(lz4);
    buf.freeze()
}

pub fn chunk_pixel_pack(pos: IVec2, pixel_count: u32, raw_size: u32, lz4: &[u8]) -> Packet {
    let mut buf = header(ServerCmd::ChunkPixelPack, 16 + lz4.len());
    buf.put_i32(pos.x);
    buf.put_i32(pos.y);
    buf.put_u32(pixel_count);
    buf.put_u32(raw_size);
    buf.put_slice(lz4);
    buf.freeze()
}

pub fn chunk_create(pos: IVec2) -> Packet {
    let mut buf = header(ServerCmd::ChunkCreate, 8);
    buf.put_i32(pos.x);
    buf.put_i32(pos.y);
    buf.freeze()
}

pub fn chunk_remove(pos: IVec2) -> Packet {
    let mut buf = header(ServerCmd::ChunkRemove, 8);
    buf.put_i32(pos.x);
    buf.put_i32(pos.y);
    buf.freeze()
}

pub fn preview_image(pos: IVec2, zoom: u8, lz4: &[u8]) -> Packet {
    let mut buf = header(ServerCmd::PreviewImage, 9 + lz4.len());
    buf.put_i32(pos.x);
    buf.put_i32(pos.y);
    buf.put_u8(zoom);
    buf.put_slice(lz4);
    buf.freeze()
}

pub fn user_create(id: u16, nickname: &str) -> Packet {
    let mut buf = header(ServerCmd::UserCreate, 2 + nickname.len());
    buf.put_u16(id);
    buf.put_slice(nickname.as_bytes());
    buf.freeze()
}

pub fn user_remove(id: u16) -> Packet {
    let mut buf = header(ServerCmd::UserRemove, 2);
    buf.put_u16(id);
    buf.freeze()
}

pub fn user_cursor_pos(id: u16, pos: IVec2) -> Packet {
    let mut buf = header(ServerCmd::UserCursorPos, 10);
    buf.put_u16(id);
    buf.put_i32(pos.x);
    buf.put_i32(pos.y);
    buf.freeze()
}
