use std::time::Duration;
use tracing::info;

use crate::Result;
use crate::packet::CaptureSession;
use crate::packet::Direction;
use crate::packet::FLAGS_ACK;
use crate::packet::FLAGS_PSH_ACK;
use crate::packet::FLAGS_SYN;
use crate::packet::FLAGS_SYN_ACK;
use crate::packet::NetworkFrame;
use crate::packet::assemble;

// Sample nonce and its accept value from RFC 6455 section 1.3. They stand in for the
// values the real connection negotiated, which are not visible from the proxy.
pub static WEBSOCKET_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub static WEBSOCKET_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Offsets of the five preamble segments from the moment the handshake fires.
static STEP_OFFSETS_MS: [u64; 5] = [0, 1, 2, 10, 20];

pub fn upgrade_request(session: &CaptureSession) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {WEBSOCKET_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        session.server.ip, session.server.port
    )
}

pub fn upgrade_response() -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {WEBSOCKET_ACCEPT}\r\n\r\n"
    )
}

/// Emit the TCP three-way handshake and the HTTP upgrade exchange, once per session.
///
/// Returns the five frames in wire order, or nothing when the session already
/// has its preamble.
pub fn synthesize(session: &mut CaptureSession, ts: Duration) -> Result<Vec<NetworkFrame>> {
    if session.handshake_done {
        return Ok(Vec::new());
    }
    let request = upgrade_request(session);
    let response = upgrade_response();
    let steps: [(Direction, u8, &[u8]); 5] = [
        (Direction::ClientToServer, FLAGS_SYN, &[]),
        (Direction::ServerToClient, FLAGS_SYN_ACK, &[]),
        (Direction::ClientToServer, FLAGS_ACK, &[]),
        (Direction::ClientToServer, FLAGS_PSH_ACK, request.as_bytes()),
        (Direction::ServerToClient, FLAGS_PSH_ACK, response.as_bytes()),
    ];

    let mut frames = Vec::with_capacity(steps.len());
    for ((direction, flags, payload), offset) in steps.into_iter().zip(STEP_OFFSETS_MS) {
        let at = ts + Duration::from_millis(offset);
        frames.push(assemble(session, at, direction, flags, payload)?);
    }
    session.handshake_done = true;
    info!(
        client = %session.client.ip,
        server = %session.server.ip,
        port = session.server.port,
        "synthesized websocket handshake"
    );
    Ok(frames)
}
