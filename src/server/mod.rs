//! TCP server: accepts one sensor connection at a time and runs the
//! ingestion path against it.
//!
//! Per session, two threads cooperate through the jitter buffer alone:
//! the ingestion path (this module) reads bytes, synchronizes frames,
//! classifies sequences, and enqueues real plus concealment PCM; the
//! playback path ([`crate::audio::PlaybackFeeder`]) drains on its own
//! cadence. Accepting a new connection tears down the previous session's
//! state entirely.
//!
//! Data-path anomalies (corrupt frames, gaps, duplicates, overflow,
//! underrun) are counted and recovered locally; only transport or sink
//! failures end a session, and even those leave the server accepting
//! the next connection.

pub mod diag;

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::audio::segment::DEFAULT_SEGMENT_SECS;
use crate::audio::{
    ConcealmentGenerator, JitterConfig, PcmFrame, PlaybackFeeder, PlaybackSink, Push,
    SegmentWriter, jitter_buffer,
};
use crate::audio::jitter::JitterCounters;
use crate::protocol::{Frame, FrameSynchronizer};
use crate::session::{SeqEvent, Session, SessionStats};
use diag::{ArrivalTracker, EdgeTracker, FrameLog, FrameRecord};

/// Read chunk size off the client socket.
const RECV_CHUNK: usize = 4096;

/// Periodic stats notice, every this many frames.
const PERIODIC_LOG_INTERVAL: u64 = 200;

/// Server configuration. Assembled from CLI flags in `main`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub jitter: JitterConfig,
    pub segment_dir: PathBuf,
    pub segment_secs: u64,
    pub packet_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            jitter: JitterConfig::default(),
            segment_dir: PathBuf::from("."),
            segment_secs: DEFAULT_SEGMENT_SECS,
            packet_log: Some(PathBuf::from("packet_log.csv")),
        }
    }
}

/// Totals reported when a session ends.
#[derive(Debug, Clone, Copy)]
pub struct SessionSummary {
    pub stats: SessionStats,
    pub jitter: JitterCounters,
    pub resync_bytes: u64,
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Accept and serve clients forever, one at a time.
    pub fn run<S, F>(&self, make_sink: F) -> Result<()>
    where
        S: PlaybackSink + 'static,
        F: Fn() -> Result<S> + Send + Clone + 'static,
    {
        SegmentWriter::clean_stale(&self.config.segment_dir);

        let listener = self.bind()?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            "listening, waiting for sensor"
        );

        loop {
            let (stream, addr) = listener.accept().context("accept failed")?;
            info!(%addr, "client connected");
            if let Err(e) = self.serve_client(stream, make_sink.clone()) {
                warn!("session ended with error: {e:?}");
            }
            info!("awaiting next connection");
        }
    }

    fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("invalid listen address")?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("failed to create socket")?;
        socket
            .set_reuse_address(true)
            .context("failed to set reuse address")?;
        socket.bind(&addr.into()).context("failed to bind socket")?;
        socket.listen(1).context("failed to listen")?;
        Ok(socket.into())
    }

    /// Run one session to completion. Returns the totals regardless of
    /// whether the client left cleanly.
    pub fn serve_client<S, F>(&self, mut stream: TcpStream, make_sink: F) -> Result<SessionSummary>
    where
        S: PlaybackSink + 'static,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let mut sync = FrameSynchronizer::new();
        let mut session = Session::new();
        let mut conceal = ConcealmentGenerator::new();
        let mut arrivals = ArrivalTracker::new();
        let mut edges = EdgeTracker::new();
        let mut segment = SegmentWriter::new(
            &self.config.segment_dir,
            8000,
            self.config.segment_secs,
        );
        let mut frame_log = match &self.config.packet_log {
            Some(path) => Some(FrameLog::create(path)?),
            None => None,
        };

        let (producer, consumer) = jitter_buffer(self.config.jitter);
        let desired_rate = Arc::new(AtomicU32::new(8000));
        let stop = Arc::new(AtomicBool::new(false));
        let feeder =
            PlaybackFeeder::start(consumer, desired_rate.clone(), stop.clone(), make_sink)?;

        let mut ingest = Ingest {
            session: &mut session,
            conceal: &mut conceal,
            arrivals: &mut arrivals,
            edges: &mut edges,
            segment: &mut segment,
            frame_log: frame_log.as_mut(),
            producer: &producer,
            desired_rate: &desired_rate,
            current_rate: 8000,
            params_applied: false,
            last_good: None,
        };

        let mut buf = [0u8; RECV_CHUNK];
        let io_result: Result<()> = 'read: loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    info!("client disconnected");
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => break Err(e).context("transport failure"),
            };
            sync.extend(&buf[..n]);

            if !ingest.params_applied {
                if let Some(params) = sync.params().copied() {
                    if let Err(e) = ingest.apply_rate(params.sample_rate) {
                        break 'read Err(e);
                    }
                    ingest.params_applied = true;
                }
            }

            while let Some(frame) = sync.next_frame() {
                if let Err(e) = ingest.handle_frame(frame) {
                    break 'read Err(e);
                }
            }
        };

        // Teardown: stop the feeder, release the queue, and let the
        // feeder finish its in-flight tick.
        let counters = ingest.counters();
        drop(ingest);
        stop.store(true, Ordering::Release);
        drop(producer);
        if feeder.join().is_err() {
            warn!("playback feeder panicked");
        }
        segment.flush().ok();
        if let Some(log) = frame_log.as_mut() {
            log.flush().ok();
        }

        // Stats are reported even when the session ends in error.
        let summary = SessionSummary {
            stats: session.stats,
            jitter: counters,
            resync_bytes: sync.resync_drops(),
        };
        log_summary(&summary);
        io_result.map(|_| summary)
    }
}

/// Ingestion-path state for one session, borrowed for the read loop.
struct Ingest<'a> {
    session: &'a mut Session,
    conceal: &'a mut ConcealmentGenerator,
    arrivals: &'a mut ArrivalTracker,
    edges: &'a mut EdgeTracker,
    segment: &'a mut SegmentWriter,
    frame_log: Option<&'a mut FrameLog>,
    producer: &'a crate::audio::JitterProducer,
    desired_rate: &'a Arc<AtomicU32>,
    current_rate: u32,
    params_applied: bool,
    last_good: Option<PcmFrame>,
}

impl Ingest<'_> {
    fn counters(&self) -> JitterCounters {
        self.producer.counters()
    }

    fn apply_rate(&mut self, rate: u32) -> Result<()> {
        if rate != self.current_rate {
            self.current_rate = rate;
            self.desired_rate.store(rate, Ordering::Release);
            self.segment.set_sample_rate(rate)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let sequence = frame.header.sequence;
        let delta_ms = self.arrivals.observe(Instant::now(), sequence);

        // The codec tag may switch the rate family mid-session.
        self.apply_rate(frame.header.sample_rate())?;

        let pcm = PcmFrame::from_payload(sequence, &frame.payload);
        let edge_jump = self.edges.observe(&pcm);
        let mean = pcm.mean();

        let obs = self.session.observe(sequence, frame.payload.len());

        if obs.conceal > 0 {
            let frame_samples = self.session.frame_samples().unwrap_or(pcm.len());
            let synthetic = self.conceal.conceal(
                obs.conceal,
                obs.classification.expected,
                frame_samples,
                self.last_good.as_ref(),
            );
            for synth in synthetic {
                match self.producer.push(synth, self.current_rate) {
                    Push::Queued => self.session.stats.concealed += 1,
                    Push::Full => self.session.stats.conceal_dropped += 1,
                    Push::Disconnected => bail!("playback side shut down, ending session"),
                }
            }
        }

        let underrun = self.producer.underrun_pending();
        let queue_depth = self.producer.queued();

        if obs.classification.event != SeqEvent::Duplicate {
            self.segment.push_samples(&pcm.samples);
            self.segment.flush_if_due()?;
            match self.producer.push(pcm.clone(), self.current_rate) {
                Push::Queued => {}
                Push::Full => warn!(sequence, "jitter buffer full, frame dropped"),
                Push::Disconnected => bail!("playback side shut down, ending session"),
            }
            self.last_good = Some(pcm);
        }

        if let Some(log) = self.frame_log.as_mut() {
            log.record(&FrameRecord {
                sequence,
                expected: obs.classification.expected,
                gap: obs.classification.gap,
                event: obs.classification.event,
                lost_total: self.session.stats.lost_frames,
                dup_total: self.session.stats.duplicates,
                reorder_total: self.session.stats.reordered,
                delta_ms,
                queue_depth,
                underrun,
                mean,
                edge_jump,
                conceal_total: self.session.stats.concealed,
            })?;
        }

        if self.session.stats.total_frames % PERIODIC_LOG_INTERVAL == 1 {
            let counters = self.producer.counters();
            info!(
                sequence,
                frames = self.session.stats.total_frames,
                lost = self.session.stats.lost_frames,
                gaps = self.session.stats.gap_events,
                max_gap = self.session.stats.max_gap,
                dup = self.session.stats.duplicates,
                reorder = self.session.stats.reordered,
                dropped = counters.dropped,
                underruns = counters.underruns,
                avg_delta_ms = format!("{:.2}", self.arrivals.average_ms()),
                buffered_ms = format!("{:.1}", self.producer.buffered_ms()),
                concealed = self.session.stats.concealed,
                "session stats"
            );
        }

        Ok(())
    }
}

fn log_summary(summary: &SessionSummary) {
    let s = &summary.stats;
    info!(
        received = s.total_frames,
        lost = s.lost_frames,
        dropped = summary.jitter.dropped,
        gaps = s.gap_events,
        max_gap = s.max_gap,
        dup = s.duplicates,
        reorder = s.reordered,
        resets = s.resets,
        underruns = summary.jitter.underruns,
        concealed = s.concealed,
        resync_bytes = summary.resync_bytes,
        "session summary"
    );
}
