//! Per-connection protocol engine: announce handshake, cursor-driven tools,
//! viewport streaming, undo history.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use glam::IVec2;
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use common::proto::{
    self, ClientCmd, MessageKind, Packet, Reader, ToolKind, Truncated,
};
use common::{coords, ChunkPixel, Color, GlobalPixel};

use crate::app::App;
use crate::chunk::Subscriber;
use crate::room::{Room, SessionHandle};
use crate::stop::Stop;
use crate::store::ChunkSlot;

/// Deepest allowed inbound queue before the client is kicked.
pub const INBOUND_QUEUE_LIMIT: usize = 1000;
/// Chunks in flight before the client must acknowledge.
const STREAM_WINDOW: i64 = 40;
/// Brush segments longer than this cancel the stroke.
const MAX_STROKE_SPAN: i32 = 300;
/// Chebyshev radius a floodfill may wander from its seed.
const FLOODFILL_RADIUS: i32 = 300;
/// Wall-clock budget of one floodfill slice.
const FLOODFILL_SLICE: Duration = Duration::from_millis(50);
/// Below this zoom, chunk streaming is pointless.
const MIN_STREAM_ZOOM: f32 = 0.45;
/// Seconds a subscribed chunk may sit outside the boundary.
const BOUNDARY_GRACE_TICKS: u32 = 5;
/// Boundary spans are capped per axis.
const MAX_BOUNDARY_SPAN: i32 = 100;
/// Undo snapshots kept per session.
const HISTORY_LIMIT: usize = 10;

/// Protocol violations; the display text is the kick reason the client sees.
#[derive(Debug, Error)]
pub enum Violation {
    #[error("Announcement packet expected")]
    AnnounceExpected,
    #[error("Already announced")]
    AlreadyAnnounced,
    #[error("Invalid room name length")]
    RoomNameLength,
    #[error("Room name can be only alphanumeric (a-z), (A-Z), (0-9), \"_\", \"-\"")]
    RoomNameCharset,
    #[error("Invalid nickname length")]
    NicknameLength,
    #[error("Invalid packet")]
    InvalidPacket,
    #[error("Got unknown packet")]
    UnknownCommand,
    #[error("Packet flood (or lag) detected")]
    PacketFlood,
    #[error("Failed to load room")]
    RoomUnavailable,
}

impl From<Truncated> for Violation {
    fn from(_: Truncated) -> Self {
        Violation::InvalidPacket
    }
}

struct Tool {
    size: u8,
    color: Color,
    kind: ToolKind,
}

impl Default for Tool {
    fn default() -> Self {
        Self {
            size: 1,
            color: Color::BLACK,
            kind: ToolKind::Brush,
        }
    }
}

#[derive(Default)]
struct Boundary {
    start: IVec2,
    end: IVec2,
    zoom: f32,
}

impl Boundary {
    /// Retention test. The end edge is inclusive here while streaming
    /// enumerates it exclusively, so an edge chunk is kept but never
    /// requested.
    fn contains(&self, pos: IVec2) -> bool {
        pos.x >= self.start.x && pos.x <= self.end.x && pos.y >= self.start.y && pos.y <= self.end.y
    }
}

struct SubscribedChunk {
    pos: IVec2,
    slot: ChunkSlot,
    ticks_outside: u32,
}

struct Floodfill {
    seed_color: Color,
    origin: IVec2,
    stack: Vec<IVec2>,
    touched: HashSet<IVec2>,
}

/// Channels wiring one connection to its session worker.
pub struct SessionPorts {
    /// Inbound frames, bounded; a full queue means the client floods.
    pub frames: Sender<Bytes>,
    /// Outbound packets in push order.
    pub packets: UnboundedReceiver<Packet>,
    /// Handle for emergency pushes (flood kick) from the transport layer.
    pub outbound: UnboundedSender<Packet>,
    pub stop: Stop,
    pub worker: JoinHandle<()>,
}

pub struct Session {
    app: Arc<App>,
    inbound: Receiver<Bytes>,
    outbound: UnboundedSender<Packet>,
    stop: Stop,

    room: Option<Arc<Room>>,
    handle: Option<Arc<SessionHandle>>,

    cursor: IVec2,
    cursor_prev: IVec2,
    cursor_sent: IVec2,
    cursor_down: bool,
    just_clicked: bool,

    tool: Tool,
    boundary: Boundary,
    needs_streaming: bool,
    subscribed: Vec<SubscribedChunk>,
    /// One-slot cache for burst access to the same chunk.
    last_chunk: Option<(IVec2, ChunkSlot)>,

    history: Vec<Vec<GlobalPixel>>,
    fill: Option<Floodfill>,

    chunks_sent: u32,
    chunks_acked: u32,

    ticks: u64,
    processed_message: bool,
}

impl Session {
    /// Spawn the worker for a fresh connection and hand back its ports.
    pub fn spawn(app: Arc<App>) -> SessionPorts {
        let (frames_tx, frames_rx) = mpsc::channel(INBOUND_QUEUE_LIMIT);
        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        let stop = Stop::new();

        let session = Session {
            app,
            inbound: frames_rx,
            outbound: packets_tx.clone(),
            stop: stop.clone(),
            room: None,
            handle: None,
            cursor: IVec2::ZERO,
            cursor_prev: IVec2::ZERO,
            cursor_sent: IVec2::ZERO,
            cursor_down: false,
            just_clicked: false,
            tool: Tool::default(),
            boundary: Boundary::default(),
            needs_streaming: false,
            subscribed: Vec::new(),
            last_chunk: None,
            history: Vec::new(),
            fill: None,
            chunks_sent: 0,
            chunks_acked: 0,
            ticks: 0,
            processed_message: false,
        };
        let worker = tokio::spawn(session.run());

        SessionPorts {
            frames: frames_tx,
            packets: packets_rx,
            outbound: packets_tx,
            stop,
            worker,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.stop.is_triggered() {
                break;
            }
            tokio::select! {
                frame = self.inbound.recv() => {
                    match frame {
                        Some(frame) => {
                            self.handle_frame(&frame);
                            self.processed_message = true;
                        }
                        // Transport gone.
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.on_tick();
                }
            }
        }

        self.cleanup();
    }

    fn on_tick(&mut self) {
        self.ticks += 1;
        if self.handle.is_some() {
            if self.ticks % 20 == 0 {
                self.broadcast_cursor();
                self.expire_subscriptions();
            }
            self.tick_floodfill();
            // Streaming waits until the client's burst of input settles.
            if !self.processed_message {
                self.stream_chunks();
            }
        }
        self.processed_message = false;
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let Some((raw_cmd, payload)) = proto::split_frame(frame) else {
            self.kick(Violation::InvalidPacket);
            return;
        };
        let Some(cmd) = ClientCmd::from_u16(raw_cmd) else {
            tracing::info!("Got unknown command {}", raw_cmd);
            self.kick(Violation::UnknownCommand);
            return;
        };
        if self.handle.is_none() && cmd != ClientCmd::Announce {
            self.kick(Violation::AnnounceExpected);
            return;
        }

        let result = match cmd {
            ClientCmd::Announce => self.on_announce(payload),
            ClientCmd::Message => self.on_message(payload),
            ClientCmd::Ping => Ok(()),
            ClientCmd::CursorPos => self.on_cursor_pos(payload),
            ClientCmd::CursorDown => self.on_cursor_down(),
            ClientCmd::CursorUp => self.on_cursor_up(),
            ClientCmd::Boundary => self.on_boundary(payload),
            ClientCmd::ChunksReceived => self.on_chunks_received(payload),
            ClientCmd::PreviewRequest => self.on_preview_request(payload),
            ClientCmd::ToolSize => self.on_tool_size(payload),
            ClientCmd::ToolColor => self.on_tool_color(payload),
            ClientCmd::ToolType => self.on_tool_type(payload),
            ClientCmd::Undo => {
                self.undo();
                Ok(())
            }
        };
        if let Err(violation) = result {
            self.kick(violation);
        }
    }

    fn kick(&mut self, violation: Violation) {
        tracing::info!("Kicking session: {}", violation);
        let _ = self.outbound.send(proto::kick(&violation.to_string()));
        self.stop.trigger();
    }

    fn ctx(&self) -> Result<(Arc<Room>, Arc<SessionHandle>), Violation> {
        match (&self.room, &self.handle) {
            (Some(room), Some(handle)) => Ok((room.clone(), handle.clone())),
            _ => Err(Violation::AnnounceExpected),
        }
    }

    // ---- commands -------------------------------------------------------

    fn on_announce(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if self.handle.is_some() {
            return Err(Violation::AlreadyAnnounced);
        }

        let mut r = Reader::new(payload);
        let room_len = r.u8()? as usize;
        if !(3..=32).contains(&room_len) {
            return Err(Violation::RoomNameLength);
        }
        let room_name = std::str::from_utf8(r.take(room_len)?)
            .map_err(|_| Violation::RoomNameCharset)?
            .to_string();
        if !room_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Violation::RoomNameCharset);
        }

        let nick_len = r.u8()? as usize;
        if !(3..=32).contains(&nick_len) {
            return Err(Violation::NicknameLength);
        }
        let nickname: String = String::from_utf8_lossy(r.take(nick_len)?)
            .chars()
            .map(|c| if matches!(c, '<' | '>' | '&') { '_' } else { c })
            .collect();

        let room = self.app.room(&room_name).map_err(|e| {
            tracing::error!("Failed to open room {:?}: {}", room_name, e);
            Violation::RoomUnavailable
        })?;

        let handle = room.add_session(
            nickname.clone(),
            self.outbound.clone(),
            self.stop.clone(),
            self.cursor,
        );
        let id = handle.id;
        let _ = self.outbound.send(proto::your_id(id));

        // Everyone learns about this session; it learns about everyone else.
        room.broadcast(proto::user_create(id, &nickname), Some(id));
        for peer in room.peers(id) {
            let _ = self.outbound.send(proto::user_create(peer.id, &peer.nickname));
            let cursor = *peer.cursor.lock();
            let _ = self.outbound.send(proto::user_cursor_pos(peer.id, cursor));
        }

        self.tool = Tool::default();
        self.room = Some(room.clone());
        self.handle = Some(handle);
        room.ext.user_join(id);
        Ok(())
    }

    fn on_message(&mut self, payload: &[u8]) -> Result<(), Violation> {
        let (room, handle) = self.ctx()?;
        let text = String::from_utf8_lossy(payload);
        if let Some(line) = text.strip_prefix('/') {
            room.ext.command(handle.id, line);
        } else {
            tracing::info!("Room {:?}: <{}> {}", room.name(), handle.nickname, text);
            room.broadcast(
                proto::message(MessageKind::Plain, &format!("<{}> {}", handle.nickname, text)),
                None,
            );
            room.ext.message(handle.id, &text);
        }
        Ok(())
    }

    fn on_cursor_pos(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if payload.len() != 8 {
            return Err(Violation::InvalidPacket);
        }
        let mut r = Reader::new(payload);
        let pos = IVec2::new(r.i32()?, r.i32()?);
        self.cursor_prev = self.cursor;
        self.cursor = pos;
        if let Some(handle) = &self.handle {
            *handle.cursor.lock() = pos;
        }
        self.apply_tool();
        Ok(())
    }

    fn on_cursor_down(&mut self) -> Result<(), Violation> {
        let (room, handle) = self.ctx()?;
        if room.ext.mouse_down(handle.id) {
            return Ok(()); // vetoed
        }
        self.cursor_down = true;
        self.just_clicked = true;
        self.cursor_prev = self.cursor;
        self.open_snapshot();
        self.apply_tool();
        Ok(())
    }

    fn on_cursor_up(&mut self) -> Result<(), Violation> {
        let (room, handle) = self.ctx()?;
        self.cursor_down = false;
        room.ext.mouse_up(handle.id);
        Ok(())
    }

    fn on_boundary(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if payload.len() != 20 {
            return Err(Violation::InvalidPacket);
        }
        let mut r = Reader::new(payload);
        let start = IVec2::new(r.i32()?, r.i32()?);
        let mut end = IVec2::new(r.i32()?, r.i32()?);
        let zoom = r.f32()?;

        end.x = end.x.max(start.x).min(start.x.saturating_add(MAX_BOUNDARY_SPAN));
        end.y = end.y.max(start.y).min(start.y.saturating_add(MAX_BOUNDARY_SPAN));

        self.boundary = Boundary { start, end, zoom };
        self.needs_streaming = true;
        Ok(())
    }

    fn on_chunks_received(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if payload.len() != 4 {
            return Err(Violation::InvalidPacket);
        }
        let mut r = Reader::new(payload);
        let count = r.u32()?;
        // The cumulative count can only grow.
        if count <= self.chunks_acked {
            return Err(Violation::InvalidPacket);
        }
        self.chunks_acked = count;
        Ok(())
    }

    fn on_preview_request(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if payload.len() != 9 {
            return Err(Violation::InvalidPacket);
        }
        let (room, _) = self.ctx()?;
        let mut r = Reader::new(payload);
        let pos = IVec2::new(r.i32()?, r.i32()?);
        let zoom = r.u8()?;
        match room.storage.load_preview(pos, zoom) {
            Ok(Some(data)) => {
                let _ = self.outbound.send(proto::preview_image(pos, zoom, &data));
            }
            Ok(None) => {}
            Err(e) => tracing::error!("preview load failed at ({}, {}): {}", pos.x, pos.y, e),
        }
        Ok(())
    }

    fn on_tool_size(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if payload.len() != 1 {
            return Err(Violation::InvalidPacket);
        }
        let size = payload[0];
        if !(1..=8).contains(&size) {
            return Err(Violation::InvalidPacket);
        }
        self.tool.size = size;
        Ok(())
    }

    fn on_tool_color(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if payload.len() != 3 {
            return Err(Violation::InvalidPacket);
        }
        self.tool.color = Color::new(payload[0], payload[1], payload[2]);
        Ok(())
    }

    fn on_tool_type(&mut self, payload: &[u8]) -> Result<(), Violation> {
        if payload.len() != 1 {
            return Err(Violation::InvalidPacket);
        }
        self.tool.kind = ToolKind::from_u8(payload[0]).ok_or(Violation::InvalidPacket)?;
        Ok(())
    }

    // ---- tools ----------------------------------------------------------

    fn apply_tool(&mut self) {
        match self.tool.kind {
            ToolKind::Brush => self.apply_brush(),
            ToolKind::Floodfill => self.start_floodfill(),
        }
        self.just_clicked = false;
    }

    fn apply_brush(&mut self) {
        if !self.cursor_down {
            return;
        }
        let Some(room) = self.room.clone() else {
            return;
        };

        let delta = self.cursor - self.cursor_prev;
        let span = delta.x.abs().max(delta.y.abs());
        if span > MAX_STROKE_SPAN {
            // A jump this large is not a stroke.
            self.cursor_down = false;
            return;
        }

        let mut pixels: Vec<GlobalPixel> = Vec::with_capacity(256);
        let color = self.tool.color;
        let steps = span as u32;
        for i in 0..=steps {
            let alpha = if steps == 0 { 0.0 } else { i as f32 / steps as f32 };
            let x = lerp(alpha, self.cursor_prev.x, self.cursor.x);
            let y = lerp(alpha, self.cursor_prev.y, self.cursor.y);
            match self.tool.size {
                1 => pixels.push(GlobalPixel {
                    pos: IVec2::new(x, y),
                    color,
                }),
                2 => {
                    for (dx, dy) in [(0, 0), (-1, 0), (1, 0), (0, -1), (0, 1)] {
                        pixels.push(GlobalPixel {
                            pos: IVec2::new(x + dx, y + dy),
                            color,
                        });
                    }
                }
                size => {
                    // Filled stamp at the stroke start, outline after, so a
                    // continuous stroke is not overdrawn.
                    let mask = room.brush_mask(size, i == 0);
                    let half = (size / 2) as i32;
                    for yy in 0..size {
                        for xx in 0..size {
                            if mask.at(xx, yy) {
                                pixels.push(GlobalPixel {
                                    pos: IVec2::new(x + xx as i32 - half, y + yy as i32 - half),
                                    color,
                                });
                            }
                        }
                    }
                }
            }
        }

        self.write_pixels(&pixels, true);
    }

    fn start_floodfill(&mut self) {
        if self.fill.is_some() || !self.just_clicked || !self.cursor_down {
            return;
        }
        let seed = self.cursor;
        let Some(seed_color) = self.read_pixel(seed) else {
            return; // outside every subscribed chunk
        };
        if seed_color == self.tool.color {
            return;
        }
        self.fill = Some(Floodfill {
            seed_color,
            origin: seed,
            stack: vec![seed],
            touched: HashSet::new(),
        });
    }

    /// Drain the fill stack for at most one time slice. Runs even while the
    /// zoomed-out boundary disables streaming.
    fn tick_floodfill(&mut self) {
        let Some(mut fill) = self.fill.take() else {
            return;
        };
        let color = self.tool.color;
        let started = Instant::now();
        let mut iterations: u32 = 0;

        while let Some(cell) = fill.stack.pop() {
            iterations += 1;

            let off = cell - fill.origin;
            if off.x.abs() > FLOODFILL_RADIUS || off.y.abs() > FLOODFILL_RADIUS {
                continue;
            }

            self.queue_write(cell, color);
            fill.touched.insert(coords::chunk_pos(cell));

            for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                let neighbor = IVec2::new(cell.x + dx, cell.y + dy);
                if let Some(current) = self.read_pixel(neighbor) {
                    if current == fill.seed_color {
                        fill.stack.push(neighbor);
                    }
                }
            }

            if iterations % 256 == 0 && started.elapsed() >= FLOODFILL_SLICE {
                break;
            }
        }

        if fill.stack.is_empty() {
            // Show the finished fill promptly.
            for pos in &fill.touched {
                if let Some(slot) = self.subscribed_chunk(*pos) {
                    slot.lock().flush_queue();
                }
            }
        } else {
            self.fill = Some(fill);
        }
    }

    // ---- pixel access ---------------------------------------------------

    /// A chunk is reachable only while this session subscribes to it.
    fn subscribed_chunk(&mut self, pos: IVec2) -> Option<ChunkSlot> {
        if let Some((cached_pos, slot)) = &self.last_chunk {
            if *cached_pos == pos {
                return Some(slot.clone());
            }
        }
        let slot = self.subscribed.iter().find(|c| c.pos == pos)?.slot.clone();
        self.last_chunk = Some((pos, slot.clone()));
        Some(slot)
    }

    fn read_pixel(&mut self, pos: IVec2) -> Option<Color> {
        let slot = self.subscribed_chunk(coords::chunk_pos(pos))?;
        let color = slot.lock().pixel(coords::local_pos(pos));
        Some(color)
    }

    /// Write one pixel through the deferred queue, recording undo state.
    fn queue_write(&mut self, pos: IVec2, color: Color) {
        let Some(slot) = self.subscribed_chunk(coords::chunk_pos(pos)) else {
            return;
        };
        let local = coords::local_pos(pos);
        let mut chunk = slot.lock();
        let before = chunk.pixel(local);
        if before != color {
            self.record_history(GlobalPixel { pos, color: before });
        }
        chunk.queue_pixel(ChunkPixel { pos: local, color });
    }

    /// Group pixels by chunk and apply them immediately, optionally
    /// recording pre-images for undo.
    fn write_pixels(&mut self, pixels: &[GlobalPixel], record_history: bool) {
        let mut by_chunk: Vec<(IVec2, Vec<ChunkPixel>, Vec<IVec2>)> = Vec::new();
        for px in pixels {
            let chunk_pos = coords::chunk_pos(px.pos);
            let entry = match by_chunk.iter_mut().find(|(pos, ..)| *pos == chunk_pos) {
                Some(entry) => entry,
                None => {
                    by_chunk.push((chunk_pos, Vec::new(), Vec::new()));
                    by_chunk.last_mut().expect("just pushed")
                }
            };
            entry.1.push(ChunkPixel {
                pos: coords::local_pos(px.pos),
                color: px.color,
            });
            entry.2.push(px.pos);
        }

        for (chunk_pos, chunk_pixels, global_positions) in by_chunk {
            let Some(slot) = self.subscribed_chunk(chunk_pos) else {
                continue;
            };
            let mut chunk = slot.lock();
            if record_history {
                for (px, global) in chunk_pixels.iter().zip(&global_positions) {
                    let before = chunk.pixel(px.pos);
                    if before != px.color {
                        self.record_history(GlobalPixel {
                            pos: *global,
                            color: before,
                        });
                    }
                }
            }
            chunk.write_pixels(&chunk_pixels);
        }
    }

    // ---- undo -----------------------------------------------------------

    fn open_snapshot(&mut self) {
        if self.history.len() >= HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(Vec::new());
    }

    fn record_history(&mut self, px: GlobalPixel) {
        if self.history.is_empty() {
            self.history.push(Vec::new());
        }
        self.history.last_mut().expect("just ensured").push(px);
    }

    /// Pop the newest snapshot and restore its pre-images. The restore
    /// itself is not recorded.
    fn undo(&mut self) {
        let Some(snapshot) = self.history.pop() else {
            return;
        };
        self.write_pixels(&snapshot, false);
    }

    // ---- cursor and boundary ticks --------------------------------------

    fn broadcast_cursor(&mut self) {
        if self.cursor == self.cursor_sent {
            return;
        }
        self.cursor_sent = self.cursor;
        if let Ok((room, handle)) = self.ctx() {
            room.broadcast(proto::user_cursor_pos(handle.id, self.cursor), None);
        }
    }

    fn expire_subscriptions(&mut self) {
        let mut to_unload: Vec<IVec2> = Vec::new();
        if self.boundary.zoom <= MIN_STREAM_ZOOM {
            // Zoomed out this far, nothing is worth keeping; drop every
            // subscription now rather than waiting out the grace period.
            to_unload.extend(self.subscribed.iter().map(|sub| sub.pos));
        } else {
            for sub in &mut self.subscribed {
                if !self.boundary.contains(sub.pos) {
                    sub.ticks_outside += 1;
                    if sub.ticks_outside == BOUNDARY_GRACE_TICKS {
                        to_unload.push(sub.pos);
                    }
                } else {
                    sub.ticks_outside = 0;
                }
            }
        }
        for pos in to_unload {
            self.unsubscribe_chunk(pos);
        }
    }

    /// Subscribe to missing in-boundary chunks, nearest to the cursor first,
    /// while the ack window has room.
    fn stream_chunks(&mut self) {
        if !self.needs_streaming {
            return;
        }
        self.needs_streaming = false;
        if self.boundary.zoom <= MIN_STREAM_ZOOM {
            return;
        }

        let mut candidates: Vec<IVec2> = Vec::new();
        for y in self.boundary.start.y..self.boundary.end.y {
            for x in self.boundary.start.x..self.boundary.end.x {
                let pos = IVec2::new(x, y);
                if !self.subscribed.iter().any(|c| c.pos == pos) {
                    candidates.push(pos);
                }
            }
        }
        if candidates.is_empty() {
            return;
        }

        let budget = STREAM_WINDOW - (self.chunks_sent as i64 - self.chunks_acked as i64);
        let center_x = self.cursor.x as f32 / coords::CHUNK_SIZE as f32;
        let center_y = self.cursor.y as f32 / coords::CHUNK_SIZE as f32;

        for _ in 0..budget.max(0) {
            if candidates.is_empty() {
                break;
            }
            let mut best = 0;
            let mut best_distance = f32::MAX;
            for (index, pos) in candidates.iter().enumerate() {
                let dx = pos.x as f32 - center_x;
                let dy = pos.y as f32 - center_y;
                let distance = dx * dx + dy * dy;
                if distance < best_distance {
                    best_distance = distance;
                    best = index;
                }
            }
            let pos = candidates.swap_remove(best);
            self.subscribe_chunk(pos);
            self.chunks_sent += 1;
        }

        self.needs_streaming = !candidates.is_empty();
    }

    fn subscribe_chunk(&mut self, pos: IVec2) {
        let Ok((room, handle)) = self.ctx() else {
            return;
        };
        if self.subscribed.iter().any(|c| c.pos == pos) {
            return;
        }
        // Announce first so the client sees create, image, then deltas.
        let _ = self.outbound.send(proto::chunk_create(pos));
        let slot = room.chunks.subscribe(
            pos,
            Subscriber {
                id: handle.id,
                tx: self.outbound.clone(),
            },
        );
        self.subscribed.push(SubscribedChunk {
            pos,
            slot,
            ticks_outside: 0,
        });
    }

    fn unsubscribe_chunk(&mut self, pos: IVec2) {
        let Some(index) = self.subscribed.iter().position(|c| c.pos == pos) else {
            return;
        };
        self.subscribed.remove(index);
        if let Some((cached_pos, _)) = &self.last_chunk {
            if *cached_pos == pos {
                self.last_chunk = None;
            }
        }
        if let Ok((room, handle)) = self.ctx() {
            room.chunks.unsubscribe(pos, handle.id);
        }
        let _ = self.outbound.send(proto::chunk_remove(pos));
    }

    // ---- teardown -------------------------------------------------------

    fn cleanup(&mut self) {
        let positions: Vec<IVec2> = self.subscribed.iter().map(|c| c.pos).collect();
        for pos in positions {
            self.unsubscribe_chunk(pos);
        }
        assert!(
            self.subscribed.is_empty(),
            "session stopped with live subscriptions"
        );
        if let Ok((room, handle)) = self.ctx() {
            room.remove_session(handle.id);
        }
        self.room = None;
        self.handle = None;
    }
}

fn lerp(alpha: f32, a: i32, b: i32) -> i32 {
    a + ((b - a) as f32 * alpha).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lerp_endpoints_are_exact() {
        assert_eq!(lerp(0.0, -5, 17), -5);
        assert_eq!(lerp(1.0, -5, 17), 17);
        assert_eq!(lerp(0.5, 0, 10), 5);
    }

    #[test]
    fn boundary_keeps_inclusive_end() {
        let boundary = Boundary {
            start: IVec2::new(-2, -2),
            end: IVec2::new(2, 2),
            zoom: 1.0,
        };
        assert!(boundary.contains(IVec2::new(-2, -2)));
        assert!(boundary.contains(IVec2::new(2, 2)));
        assert!(!boundary.contains(IVec2::new(3, 0)));
    }

    #[test]
    fn violations_spell_their_kick_reason() {
        assert_eq!(
            Violation::PacketFlood.to_string(),
            "Packet flood (or lag) detected"
        );
        assert_eq!(
            Violation::AnnounceExpected.to_string(),
            "Announcement packet expected"
        );
    }
}
