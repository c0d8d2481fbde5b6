use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Result;
use crate::clock::CaptureClock;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::CaptureConfig;
use crate::error::WscaptureError;
use crate::frame;
use crate::handshake;
use crate::packet;
use crate::packet::CaptureSession;
use crate::packet::Direction;
use crate::packet::NetworkFrame;
use crate::pcap::FileHeader;
use crate::pcap::PacketRecord;
use crate::pcap::PcapByteOrder;

fn write_records<W: Write>(
    sink: &mut W,
    records: &[PacketRecord],
    pbo: PcapByteOrder,
) -> Result<()> {
    for r in records {
        r.write(sink, pbo)?;
    }
    sink.flush()?;
    Ok(())
}

struct WriterState<W: Write> {
    // None once closed
    sink: Option<W>,
    session: CaptureSession,
    clock: CaptureClock,
    poisoned: bool,
    records: u64,
}

impl<W: Write> WriterState<W> {
    fn sink(&mut self) -> Result<&mut W> {
        if self.poisoned {
            return Err(WscaptureError::SinkPoisoned);
        }
        match self.sink.as_mut() {
            Some(sink) => Ok(sink),
            None => Err(WscaptureError::WriterClosed),
        }
    }
    /// Append one record per frame and flush. Any sink error kills the session.
    fn append(&mut self, frames: &[NetworkFrame], pbo: PcapByteOrder) -> Result<()> {
        let mut records = Vec::with_capacity(frames.len());
        for f in frames {
            let ts = self.clock.stamp(f.ts);
            records.push(PacketRecord::new(ts, &f.data));
        }
        let sink = self.sink()?;
        match write_records(sink, &records, pbo) {
            Ok(_) => {
                self.records += records.len() as u64;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "capture sink write failed, session is dead");
                self.poisoned = true;
                Err(e)
            }
        }
    }
    fn ensure_handshake(&mut self, pbo: PcapByteOrder) -> Result<()> {
        if self.session.handshake_done {
            return Ok(());
        }
        // refuse before touching the session
        self.sink()?;
        let base = self.clock.now()?;
        let frames = handshake::synthesize(&mut self.session, base)?;
        self.append(&frames, pbo)
    }
}

/// Writes a classic pcap file that looks like a captured WebSocket connection.
///
/// Every call takes the one session lock for the whole handshake, assemble, append
/// and flush sequence, so the writer can be shared between the two forwarding
/// directions of a proxied connection.
/// ```rust,no_run
/// use wscapture::CaptureConfig;
/// use wscapture::PcapFileWriter;
///
/// let config = CaptureConfig::new("example.com", 5000, 80);
/// let writer = PcapFileWriter::create("session.pcap", config).unwrap();
/// writer.write_client_to_server(b"hello").unwrap();
/// writer.write_server_to_client(b"world").unwrap();
/// writer.close().unwrap();
/// ```
pub struct PcapFileWriter<W: Write + Send = BufWriter<File>> {
    config: CaptureConfig,
    state: Mutex<WriterState<W>>,
}

impl PcapFileWriter<BufWriter<File>> {
    /// Create (truncate) `path` and write the pcap file header to it.
    pub fn create<P: AsRef<Path>>(
        path: P,
        config: CaptureConfig,
    ) -> Result<PcapFileWriter<BufWriter<File>>> {
        let path = path.as_ref();
        let fs = match File::create(path) {
            Ok(fs) => fs,
            Err(e) => {
                return Err(WscaptureError::OpenSinkError {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        match Self::new(BufWriter::new(fs), config) {
            Ok(writer) => {
                info!(path = %path.display(), "opened capture file");
                Ok(writer)
            }
            Err(e) => {
                // no half written header left behind
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }
}

impl<W: Write + Send> PcapFileWriter<W> {
    pub fn new(sink: W, config: CaptureConfig) -> Result<PcapFileWriter<W>> {
        Self::with_clock(sink, config, Box::new(SystemClock))
    }
    pub fn with_clock(
        mut sink: W,
        config: CaptureConfig,
        clock: Box<dyn Clock>,
    ) -> Result<PcapFileWriter<W>> {
        let header = FileHeader::new(config.snaplen);
        header.write(&mut sink, config.byte_order)?;
        sink.flush()?;

        let state = WriterState {
            sink: Some(sink),
            session: CaptureSession::new(&config),
            clock: CaptureClock::new(clock),
            poisoned: false,
            records: 0,
        };
        debug!(
            host = %config.server_host,
            client_port = config.client_port,
            server_port = config.server_port,
            "capture session started"
        );
        Ok(PcapFileWriter {
            config,
            state: Mutex::new(state),
        })
    }
    fn lock(&self) -> Result<MutexGuard<'_, WriterState<W>>> {
        match self.state.lock() {
            Ok(s) => Ok(s),
            Err(e) => Err(WscaptureError::UnlockMutexError { e: e.to_string() }),
        }
    }
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
    /// Emit the connection preamble now instead of before the first message.
    pub fn write_handshake(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.ensure_handshake(self.config.byte_order)
    }
    /// Frame `payload` as one WebSocket message travelling in `direction` and
    /// append it to the capture, after the preamble if this is the first message.
    ///
    /// A frame too big for one record goes out as several consecutive segments.
    pub fn write_message(&self, direction: Direction, payload: &[u8]) -> Result<()> {
        let pbo = self.config.byte_order;
        let mut state = self.lock()?;
        state.ensure_handshake(pbo)?;
        state.sink()?;

        let ws_frame = frame::encode(payload, direction.from_client(), self.config.mask_key);
        let ts = state.clock.read()?;
        let max_payload = packet::max_segment_payload(self.config.snaplen);
        let segments =
            packet::assemble_stream(&mut state.session, ts, direction, &ws_frame, max_payload)?;
        state.append(&segments, pbo)?;
        debug!(%direction, len = payload.len(), "captured websocket message");
        Ok(())
    }
    pub fn write_client_to_server(&self, payload: &[u8]) -> Result<()> {
        self.write_message(Direction::ClientToServer, payload)
    }
    pub fn write_server_to_client(&self, payload: &[u8]) -> Result<()> {
        self.write_message(Direction::ServerToClient, payload)
    }
    /// Flush and release the sink. Calling it again does nothing.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock()?;
        let records = state.records;
        match state.sink.take() {
            Some(mut sink) => {
                if !state.poisoned {
                    sink.flush()?;
                }
                info!(records, "capture closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.lock()?.sink.is_none())
    }
    /// Packet records appended so far, handshake segments included.
    pub fn records_written(&self) -> Result<u64> {
        Ok(self.lock()?.records)
    }
    /// Copy of the current counters.
    pub fn session(&self) -> Result<CaptureSession> {
        Ok(self.lock()?.session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::ScriptedClock;
    use crate::packet::SegmentView;
    use crate::pcap::Pcap;
    use std::io;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts `budget` bytes, then fails every write.
    struct FailingSink {
        budget: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig::new("example.com", 5000, 80)
    }

    #[test]
    fn header_written_on_construction() {
        let buf = SharedBuf::default();
        let writer = PcapFileWriter::new(buf.clone(), config()).unwrap();
        assert_eq!(buf.bytes().len(), 24);
        writer.close().unwrap();
        assert_eq!(buf.bytes().len(), 24);
        assert_eq!(writer.records_written().unwrap(), 0);
    }
    #[test]
    fn first_message_brings_handshake() {
        let buf = SharedBuf::default();
        let writer = PcapFileWriter::new(buf.clone(), config()).unwrap();
        writer.write_server_to_client(b"server speaks first").unwrap();
        assert_eq!(writer.records_written().unwrap(), 6);
        writer.write_client_to_server(b"reply").unwrap();
        assert_eq!(writer.records_written().unwrap(), 7);
        writer.close().unwrap();

        let pcap = Pcap::read_all(&mut buf.bytes().as_slice()).unwrap();
        assert_eq!(pcap.byte_order, PcapByteOrder::BigEndian);
        assert_eq!(pcap.records.len(), 7);
        let last = SegmentView::parse(&pcap.records[6].packet_data).unwrap();
        let decoded = frame::decode(&last.payload).unwrap();
        assert_eq!(decoded.payload, b"reply");
    }
    #[test]
    fn explicit_handshake_runs_once() {
        let buf = SharedBuf::default();
        let writer = PcapFileWriter::new(buf.clone(), config()).unwrap();
        writer.write_handshake().unwrap();
        writer.write_handshake().unwrap();
        assert_eq!(writer.records_written().unwrap(), 5);
        writer.write_client_to_server(b"x").unwrap();
        assert_eq!(writer.records_written().unwrap(), 6);
    }
    #[test]
    fn timestamps_do_not_go_backwards() {
        let s = Duration::from_secs;
        // the data reading lands before the handshake's +20ms step
        let clock = ScriptedClock::new(&[s(100), s(100), s(99), s(101)]);
        let buf = SharedBuf::default();
        let writer = PcapFileWriter::with_clock(buf.clone(), config(), Box::new(clock)).unwrap();
        writer.write_client_to_server(b"a").unwrap();
        writer.write_server_to_client(b"b").unwrap();
        writer.write_client_to_server(b"c").unwrap();
        writer.close().unwrap();

        let pcap = Pcap::read_all(&mut buf.bytes().as_slice()).unwrap();
        let ts: Vec<Duration> = pcap.records.iter().map(|r| r.timestamp()).collect();
        assert_eq!(ts.len(), 8);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(ts[4], s(100) + Duration::from_millis(20));
        assert_eq!(ts[5], ts[4]);
        assert_eq!(ts[6], ts[4]);
        assert_eq!(ts[7], s(101));
    }
    #[test]
    fn write_after_close_fails() {
        let writer = PcapFileWriter::new(SharedBuf::default(), config()).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed().unwrap());
        assert!(matches!(
            writer.write_client_to_server(b"late"),
            Err(WscaptureError::WriterClosed)
        ));
        assert!(matches!(
            writer.write_handshake(),
            Err(WscaptureError::WriterClosed)
        ));
        // nothing moved
        assert!(!writer.session().unwrap().handshake_done);
    }
    #[test]
    fn sink_failure_poisons_session() {
        // room for the file header and part of the first record
        let sink = FailingSink { budget: 24 + 30 };
        let writer = PcapFileWriter::new(sink, config()).unwrap();
        assert!(matches!(
            writer.write_client_to_server(b"hello"),
            Err(WscaptureError::IOError(_))
        ));
        assert!(matches!(
            writer.write_client_to_server(b"again"),
            Err(WscaptureError::SinkPoisoned)
        ));
        assert_eq!(writer.records_written().unwrap(), 0);
        writer.close().unwrap();
    }
    #[test]
    fn header_failure_is_reported() {
        let sink = FailingSink { budget: 10 };
        assert!(matches!(
            PcapFileWriter::new(sink, config()),
            Err(WscaptureError::IOError(_))
        ));
    }
    #[test]
    fn large_message_spans_segments() {
        let buf = SharedBuf::default();
        let writer = PcapFileWriter::new(buf.clone(), config()).unwrap();
        let big = vec![b'a'; 100_000];
        writer.write_client_to_server(&big).unwrap();
        // frame is 100014 bytes, at most 65481 per segment
        assert_eq!(writer.records_written().unwrap(), 5 + 2);
        writer.write_server_to_client(b"small").unwrap();
        assert_eq!(writer.records_written().unwrap(), 8);
        writer.close().unwrap();

        let pcap = Pcap::read_all(&mut buf.bytes().as_slice()).unwrap();
        assert_eq!(pcap.records.len(), 8);
        for r in &pcap.records {
            assert!(r.captured_packet_length <= pcap.header.snaplen);
            assert_eq!(r.captured_packet_length, r.original_packet_length);
        }
        let views: Vec<SegmentView> = pcap
            .records
            .iter()
            .map(|r| SegmentView::parse(&r.packet_data).unwrap())
            .collect();
        assert_eq!(views[6].seq, views[5].seq + views[5].payload.len() as u32);
        assert_eq!(views[7].ack, views[6].seq + views[6].payload.len() as u32);

        let joined: Vec<u8> = views[5..7]
            .iter()
            .flat_map(|v| v.payload.iter().copied())
            .collect();
        let decoded = frame::decode(&joined).unwrap();
        assert_eq!(decoded.consumed, joined.len());
        assert_eq!(decoded.payload, big);
    }
    #[test]
    fn records_respect_a_small_snaplen() {
        let buf = SharedBuf::default();
        let mut config = config();
        config.snaplen = 1500;
        let writer = PcapFileWriter::new(buf.clone(), config).unwrap();
        let msg = vec![0x5a; 4000];
        writer.write_server_to_client(&msg).unwrap();
        writer.close().unwrap();

        let pcap = Pcap::read_all(&mut buf.bytes().as_slice()).unwrap();
        assert_eq!(pcap.header.snaplen, 1500);
        // 4004 byte frame over 1446 byte segments
        assert_eq!(pcap.records.len(), 5 + 3);
        assert!(pcap.records.iter().all(|r| r.captured_packet_length <= 1500));
        let joined: Vec<u8> = pcap.records[5..]
            .iter()
            .flat_map(|r| SegmentView::parse(&r.packet_data).unwrap().payload)
            .collect();
        assert_eq!(frame::decode(&joined).unwrap().payload, msg);
    }
    #[test]
    fn concurrent_directions_stay_consistent() {
        let buf = SharedBuf::default();
        let writer = Arc::new(PcapFileWriter::new(buf.clone(), config()).unwrap());
        let mut handles = Vec::new();
        for direction in [Direction::ClientToServer, Direction::ServerToClient] {
            let writer = Arc::clone(&writer);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let msg = format!("{direction} #{i}");
                    writer.write_message(direction, msg.as_bytes()).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        writer.close().unwrap();

        let pcap = Pcap::read_all(&mut buf.bytes().as_slice()).unwrap();
        assert_eq!(pcap.records.len(), 5 + 100);
        let views: Vec<SegmentView> = pcap
            .records
            .iter()
            .map(|r| SegmentView::parse(&r.packet_data).unwrap())
            .collect();
        // ip ids are consecutive in file order
        for (i, v) in views.iter().enumerate() {
            assert_eq!(v.ip_id, 1 + i as u16);
        }
        // per direction, each data segment starts where the previous one ended
        for port in [5000u16, 80] {
            let data: Vec<&SegmentView> = views[5..]
                .iter()
                .filter(|v| v.src.port == port)
                .collect();
            assert_eq!(data.len(), 50);
            for w in data.windows(2) {
                assert_eq!(w[1].seq, w[0].seq.wrapping_add(w[0].payload.len() as u32));
            }
        }
    }
}
