//! End-to-end protocol scenarios over in-process sessions: real rooms, real
//! chunk stores, real workers; only the WebSocket transport is replaced by
//! channels.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use glam::{IVec2, U8Vec2};
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use common::proto::{Packet, Reader, ServerCmd};
use common::{codec, coords, ChunkPixel, Color};
use server::app::App;
use server::config::Config;
use server::ext::ExtensionHost;
use server::session::Session;
use server::stop::Stop;

struct TestClient {
    frames: Sender<Bytes>,
    packets: UnboundedReceiver<Packet>,
    stop: Stop,
}

fn test_app(dir: &tempfile::TempDir) -> Arc<App> {
    let mut config = Config::default();
    config.rooms_dir = dir.path().to_string_lossy().into_owned();
    App::new(config)
}

fn packet_cmd(packet: &Packet) -> u16 {
    u16::from_be_bytes([packet[0], packet[1]])
}

impl TestClient {
    fn connect(app: &Arc<App>) -> Self {
        let ports = Session::spawn(app.clone());
        Self {
            frames: ports.frames,
            packets: ports.packets,
            stop: ports.stop,
        }
    }

    async fn send(&self, cmd: u16, payload: &[u8]) {
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&cmd.to_be_bytes());
        frame.extend_from_slice(payload);
        self.frames
            .send(Bytes::from(frame))
            .await
            .expect("session worker gone");
    }

    async fn recv(&mut self) -> Packet {
        tokio::time::timeout(Duration::from_secs(30), self.packets.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("session closed")
    }

    async fn recv_cmd(&mut self, cmd: ServerCmd) -> Packet {
        loop {
            let packet = self.recv().await;
            if packet_cmd(&packet) == cmd as u16 {
                return packet;
            }
        }
    }

    /// Collect everything that arrives within the window.
    async fn drain(&mut self, window: Duration) -> Vec<Packet> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.packets.recv()).await {
                Ok(Some(packet)) => out.push(packet),
                _ => break,
            }
        }
        out
    }

    async fn announce(&mut self, room: &str, nick: &str) -> u16 {
        let mut payload = Vec::new();
        payload.push(room.len() as u8);
        payload.extend_from_slice(room.as_bytes());
        payload.push(nick.len() as u8);
        payload.extend_from_slice(nick.as_bytes());
        self.send(2, &payload).await;
        let packet = self.recv_cmd(ServerCmd::YourId).await;
        u16::from_be_bytes([packet[2], packet[3]])
    }

    async fn set_boundary(&self, start: (i32, i32), end: (i32, i32), zoom: f32) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&start.0.to_be_bytes());
        payload.extend_from_slice(&start.1.to_be_bytes());
        payload.extend_from_slice(&end.0.to_be_bytes());
        payload.extend_from_slice(&end.1.to_be_bytes());
        payload.extend_from_slice(&zoom.to_be_bytes());
        self.send(103, &payload).await;
    }

    async fn cursor_pos(&self, x: i32, y: i32) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&x.to_be_bytes());
        payload.extend_from_slice(&y.to_be_bytes());
        self.send(100, &payload).await;
    }

    async fn cursor_down(&self) {
        self.send(101, &[]).await;
    }

    async fn cursor_up(&self) {
        self.send(102, &[]).await;
    }

    async fn tool_color(&self, r: u8, g: u8, b: u8) {
        self.send(201, &[r, g, b]).await;
    }

    async fn tool_type(&self, kind: u8) {
        self.send(202, &[kind]).await;
    }

    async fn undo(&self) {
        self.send(203, &[]).await;
    }

    async fn chunks_received(&self, count: u32) {
        self.send(104, &count.to_be_bytes()).await;
    }
}

fn decode_pixel_pack(packet: &Packet) -> (IVec2, Vec<(u8, u8, Color)>) {
    let mut r = Reader::new(&packet[2..]);
    let pos = IVec2::new(r.i32().unwrap(), r.i32().unwrap());
    let count = r.u32().unwrap() as usize;
    let raw_size = r.u32().unwrap() as usize;
    let raw = codec::decompress(r.take(r.remaining()).unwrap(), raw_size).unwrap();
    assert_eq!(raw.len(), count * 5);
    let records = raw
        .chunks(5)
        .map(|rec| (rec[0], rec[1], Color::new(rec[2], rec[3], rec[4])))
        .collect();
    (pos, records)
}

fn decode_chunk_pos(packet: &Packet) -> IVec2 {
    let mut r = Reader::new(&packet[2..]);
    IVec2::new(r.i32().unwrap(), r.i32().unwrap())
}

fn read_canvas_pixel(app: &Arc<App>, room: &str, pos: IVec2) -> Color {
    app.room(room)
        .unwrap()
        .chunks
        .get_or_load(coords::chunk_pos(pos))
        .lock()
        .pixel(coords::local_pos(pos))
}

#[tokio::test(start_paused = true)]
async fn announce_assigns_ids_and_introduces_peers() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut alice = TestClient::connect(&app);
    assert_eq!(alice.announce("lobby", "alice").await, 0);

    let mut bob = TestClient::connect(&app);
    assert_eq!(bob.announce("lobby", "bobby").await, 1);

    // Alice hears about bob...
    let packet = alice.recv_cmd(ServerCmd::UserCreate).await;
    assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 1);
    assert_eq!(&packet[4..], b"bobby");

    // ...and bob was introduced to alice along with her cursor.
    let packet = bob.recv_cmd(ServerCmd::UserCreate).await;
    assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    assert_eq!(&packet[4..], b"alice");
    bob.recv_cmd(ServerCmd::UserCursorPos).await;
}

#[tokio::test(start_paused = true)]
async fn anything_before_announce_kicks() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.cursor_pos(0, 0).await;
    let packet = client.recv_cmd(ServerCmd::Kick).await;
    assert_eq!(&packet[2..], b"Announcement packet expected");
    assert!(client.stop.is_triggered());
}

#[tokio::test(start_paused = true)]
async fn malformed_announce_kicks() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.send(2, &[2, b'a', b'b', 5, b'h'], ).await;
    let packet = client.recv_cmd(ServerCmd::Kick).await;
    assert_eq!(&packet[2..], b"Invalid room name length");
}

#[tokio::test(start_paused = true)]
async fn nickname_sanitizes_markup_characters() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut alice = TestClient::connect(&app);
    alice.announce("lobby", "a<b>&c").await;

    let mut bob = TestClient::connect(&app);
    bob.announce("lobby", "bobby").await;

    let packet = bob.recv_cmd(ServerCmd::UserCreate).await;
    assert_eq!(&packet[4..], b"a_b__c");
}

#[tokio::test(start_paused = true)]
async fn single_brush_dot_reaches_every_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut alice = TestClient::connect(&app);
    alice.announce("lobby", "alice").await;
    alice.set_boundary((0, 0), (1, 1), 1.0).await;
    alice.recv_cmd(ServerCmd::ChunkImage).await;

    let mut bob = TestClient::connect(&app);
    bob.announce("lobby", "bobby").await;
    bob.set_boundary((0, 0), (1, 1), 1.0).await;
    bob.recv_cmd(ServerCmd::ChunkImage).await;

    alice.tool_color(255, 0, 0).await;
    alice.cursor_pos(10, 10).await;
    alice.cursor_down().await;

    for client in [&mut alice, &mut bob] {
        let packet = client.recv_cmd(ServerCmd::ChunkPixelPack).await;
        let (pos, records) = decode_pixel_pack(&packet);
        assert_eq!(pos, IVec2::ZERO);
        assert_eq!(records, vec![(10, 10, Color::new(255, 0, 0))]);
    }

    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(10, 10)),
        Color::new(255, 0, 0)
    );
}

#[tokio::test(start_paused = true)]
async fn negative_coordinates_land_in_negative_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.set_boundary((-1, -1), (0, 0), 1.0).await;
    client.recv_cmd(ServerCmd::ChunkImage).await;

    client.tool_color(0, 128, 0).await;
    client.cursor_pos(-1, -1).await;
    client.cursor_down().await;

    let packet = client.recv_cmd(ServerCmd::ChunkPixelPack).await;
    let (pos, records) = decode_pixel_pack(&packet);
    assert_eq!(pos, IVec2::new(-1, -1));
    assert_eq!(records, vec![(255, 255, Color::new(0, 128, 0))]);
}

#[tokio::test(start_paused = true)]
async fn overlong_stroke_cancels_instead_of_drawing() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.set_boundary((0, 0), (4, 1), 1.0).await;
    for _ in 0..4 {
        client.recv_cmd(ServerCmd::ChunkImage).await;
    }

    client.cursor_pos(0, 0).await;
    client.cursor_down().await;
    client.recv_cmd(ServerCmd::ChunkPixelPack).await; // the initial dot
    client.cursor_pos(1000, 0).await;

    // Let several ticks pass; nothing else may arrive.
    let extras = client.drain(Duration::from_secs(2)).await;
    assert!(
        extras
            .iter()
            .all(|p| packet_cmd(p) != ServerCmd::ChunkPixelPack as u16),
        "the cancelled segment must not paint"
    );
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(0, 0)),
        Color::BLACK
    );
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(1, 0)),
        Color::WHITE
    );
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(1000, 0)),
        Color::WHITE
    );
}

#[tokio::test(start_paused = true)]
async fn floodfill_paints_the_connected_region_only() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;

    // Stage the canvas before anyone subscribes: all black except a 10x10
    // white pocket at the origin.
    {
        let room = app.room("lobby").unwrap();
        let slot = room.chunks.get_or_load(IVec2::ZERO);
        let mut chunk = slot.lock();
        let mut pixels = Vec::new();
        for y in 0..=255u8 {
            for x in 0..=255u8 {
                if x >= 10 || y >= 10 {
                    pixels.push(ChunkPixel {
                        pos: U8Vec2::new(x, y),
                        color: Color::BLACK,
                    });
                }
            }
        }
        chunk.write_pixels(&pixels);
    }

    client.set_boundary((0, 0), (1, 1), 1.0).await;
    client.recv_cmd(ServerCmd::ChunkImage).await;

    client.tool_type(1).await;
    client.tool_color(255, 0, 0).await;
    client.cursor_pos(5, 5).await;
    client.cursor_down().await;

    // The fill runs in 50ms slices and flushes its chunks when done.
    let packets = client.drain(Duration::from_secs(3)).await;
    assert!(packets
        .iter()
        .any(|p| packet_cmd(p) == ServerCmd::ChunkPixelPack as u16));

    for y in 0..10 {
        for x in 0..10 {
            assert_eq!(
                read_canvas_pixel(&app, "lobby", IVec2::new(x, y)),
                Color::new(255, 0, 0),
                "({x}, {y}) must be filled"
            );
        }
    }
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(10, 0)),
        Color::BLACK
    );
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(0, 10)),
        Color::BLACK
    );
}

#[tokio::test(start_paused = true)]
async fn undo_restores_the_canvas_before_the_stroke() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.set_boundary((0, 0), (1, 1), 1.0).await;
    client.recv_cmd(ServerCmd::ChunkImage).await;

    client.tool_color(1, 2, 3).await;
    client.cursor_pos(3, 3).await;
    client.cursor_down().await;
    client.recv_cmd(ServerCmd::ChunkPixelPack).await;
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(3, 3)),
        Color::new(1, 2, 3)
    );

    client.cursor_up().await;
    client.undo().await;

    let packet = client.recv_cmd(ServerCmd::ChunkPixelPack).await;
    let (_, records) = decode_pixel_pack(&packet);
    assert_eq!(records, vec![(3, 3, Color::WHITE)]);
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(3, 3)),
        Color::WHITE
    );

    // Nothing left to undo; a second undo is silent.
    client.undo().await;
    let extras = client.drain(Duration::from_secs(1)).await;
    assert!(extras
        .iter()
        .all(|p| packet_cmd(p) != ServerCmd::ChunkPixelPack as u16));
}

#[tokio::test(start_paused = true)]
async fn streaming_respects_the_ack_window() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    // 100 candidate chunks, but only 40 may be in flight unacknowledged.
    client.set_boundary((0, 0), (10, 10), 1.0).await;

    let first = client.drain(Duration::from_secs(3)).await;
    let created = first
        .iter()
        .filter(|p| packet_cmd(p) == ServerCmd::ChunkCreate as u16)
        .count();
    assert_eq!(created, 40);

    client.chunks_received(40).await;
    let second = client.drain(Duration::from_secs(3)).await;
    let created = second
        .iter()
        .filter(|p| packet_cmd(p) == ServerCmd::ChunkCreate as u16)
        .count();
    assert_eq!(created, 40);

    // A non-increasing acknowledgement is a protocol violation.
    client.chunks_received(40).await;
    let packet = client.recv_cmd(ServerCmd::Kick).await;
    assert_eq!(&packet[2..], b"Invalid packet");
}

#[tokio::test(start_paused = true)]
async fn chunks_stream_nearest_to_the_cursor_first() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.cursor_pos(640, 640).await; // chunk space (2.5, 2.5)
    client.set_boundary((0, 0), (5, 5), 1.0).await;

    let packet = client.recv_cmd(ServerCmd::ChunkCreate).await;
    assert_eq!(decode_chunk_pos(&packet), IVec2::new(2, 2));
}

#[tokio::test(start_paused = true)]
async fn leaving_the_boundary_expires_subscriptions() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.set_boundary((0, 0), (1, 1), 1.0).await;
    client.recv_cmd(ServerCmd::ChunkImage).await;

    // Move the viewport far away; the old chunk survives its 5s grace, then
    // goes away.
    client.set_boundary((50, 50), (51, 51), 1.0).await;
    let packet = client.recv_cmd(ServerCmd::ChunkRemove).await;
    assert_eq!(decode_chunk_pos(&packet), IVec2::ZERO);
}

#[tokio::test(start_paused = true)]
async fn zooming_out_drops_subscriptions_without_grace() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.set_boundary((0, 0), (1, 1), 1.0).await;
    client.recv_cmd(ServerCmd::ChunkImage).await;

    // Same rectangle, but zoomed below the streaming threshold: the chunk
    // must go away on the next expiry tick, well inside the 5s grace that
    // covers ordinary boundary exits.
    client.set_boundary((0, 0), (1, 1), 0.2).await;
    let packets = client.drain(Duration::from_secs(2)).await;
    let removed: Vec<IVec2> = packets
        .iter()
        .filter(|p| packet_cmd(p) == ServerCmd::ChunkRemove as u16)
        .map(|p| decode_chunk_pos(p))
        .collect();
    assert_eq!(removed, vec![IVec2::ZERO]);
}

#[tokio::test(start_paused = true)]
async fn zoomed_out_boundary_streams_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.set_boundary((0, 0), (3, 3), 0.2).await;

    let packets = client.drain(Duration::from_secs(2)).await;
    assert!(packets
        .iter()
        .all(|p| packet_cmd(p) != ServerCmd::ChunkCreate as u16));
}

#[tokio::test(start_paused = true)]
async fn chat_is_relayed_with_the_nickname() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut alice = TestClient::connect(&app);
    alice.announce("lobby", "alice").await;
    let mut bob = TestClient::connect(&app);
    bob.announce("lobby", "bobby").await;

    alice.send(1, b"hello there").await;

    let packet = bob.recv_cmd(ServerCmd::Message).await;
    assert_eq!(packet[2], 0); // plain text
    assert_eq!(&packet[3..], b"<alice> hello there");
}

#[tokio::test(start_paused = true)]
async fn cursor_movement_is_broadcast_once_settled() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut alice = TestClient::connect(&app);
    let alice_id = alice.announce("lobby", "alice").await;
    let mut bob = TestClient::connect(&app);
    bob.announce("lobby", "bobby").await;

    alice.cursor_pos(42, -7).await;

    // Skip the cursor snapshot sent at announce time; wait for the moved one.
    loop {
        let packet = bob.recv_cmd(ServerCmd::UserCursorPos).await;
        let mut r = Reader::new(&packet[2..]);
        let id = r.u16().unwrap();
        let x = r.i32().unwrap();
        let y = r.i32().unwrap();
        if id == alice_id && (x, y) == (42, -7) {
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn preview_request_answers_from_storage() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir);

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;

    let tile = codec::compress(&vec![9u8; coords::CHUNK_IMAGE_BYTES]);
    let room = app.room("lobby").unwrap();
    room.storage.save_preview(IVec2::new(1, -1), 2, &tile).unwrap();

    let mut payload = Vec::new();
    payload.extend_from_slice(&1i32.to_be_bytes());
    payload.extend_from_slice(&(-1i32).to_be_bytes());
    payload.push(2);
    client.send(105, &payload).await;

    let packet = client.recv_cmd(ServerCmd::PreviewImage).await;
    let mut r = Reader::new(&packet[2..]);
    assert_eq!(r.i32().unwrap(), 1);
    assert_eq!(r.i32().unwrap(), -1);
    assert_eq!(r.u8().unwrap(), 2);
    let raw = codec::decompress(r.take(r.remaining()).unwrap(), coords::CHUNK_IMAGE_BYTES).unwrap();
    assert!(raw.iter().all(|&b| b == 9));

    // A missing tile earns no reply at all.
    let mut payload = Vec::new();
    payload.extend_from_slice(&5i32.to_be_bytes());
    payload.extend_from_slice(&5i32.to_be_bytes());
    payload.push(1);
    client.send(105, &payload).await;
    let extras = client.drain(Duration::from_secs(1)).await;
    assert!(extras
        .iter()
        .all(|p| packet_cmd(p) != ServerCmd::PreviewImage as u16));
}

struct VetoHost;

impl ExtensionHost for VetoHost {
    fn mouse_down(&self, _session: u16) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn extension_host_can_veto_clicks() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.rooms_dir = dir.path().to_string_lossy().into_owned();
    let app = App::with_host(config, Arc::new(VetoHost));

    let mut client = TestClient::connect(&app);
    client.announce("lobby", "alice").await;
    client.set_boundary((0, 0), (1, 1), 1.0).await;
    client.recv_cmd(ServerCmd::ChunkImage).await;

    client.cursor_pos(7, 7).await;
    client.cursor_down().await;

    let packets = client.drain(Duration::from_secs(1)).await;
    assert!(packets
        .iter()
        .all(|p| packet_cmd(p) != ServerCmd::ChunkPixelPack as u16));
    assert_eq!(
        read_canvas_pixel(&app, "lobby", IVec2::new(7, 7)),
        Color::WHITE
    );
}
