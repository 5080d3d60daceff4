//! Participants: one connected remote peer and everything multiplexed over
//! its connection.
//!
//! A [`Participant`] owns
//! - Sid allocation, seeded from the handshake offset and never reused,
//! - the open streams and the bookkeeping channels,
//! - an admission queue surfacing remotely opened streams by priority,
//! - a FIFO of [`ParticipantEvent`]s,
//! - a 1 Hz bandwidth sample published on a `watch` channel.
//!
//! ## Tasks
//! Framed transports (TCP, UDP and the QUIC control stream) get a send task
//! draining the outbound [`WaitQueue`] into frames and a receive task
//! reassembling `DataHeader`/`Data` frames into messages. A resend driver
//! periodically walks every reliable stream and queues what is due. QUIC
//! additionally runs an accept loop for native streams; the in-process
//! transport only needs the receive task for its control frames.
//!
//! All tasks stop on the participant's cancellation token, which is a child of
//! the owning network's token.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::channel::{Channel, ChannelInfo};
use crate::config::NetworkConfig;
use crate::core::frame::{ITFrame, OTFrame};
use crate::core::types::{
    Bandwidth, Cid, HandshakeFeatures, Mid, Pid, Prio, Secret, Sid, StreamParams, LOWEST_PRIO,
    STREAM_ID_OFFSET1, STREAM_ID_OFFSET2,
};
use crate::error::{ParticipantError, ParticipantResult};
use crate::protocol::handshake::HandshakeOutcome;
use crate::protocol::prio::WaitQueue;
use crate::protocol::reliable;
use crate::stream::{new_inbox, Backend, Inbound, Stream, StreamShared};
use crate::transport::mpsc::LocalFrame;
use crate::transport::{quic, FrameSink, FrameSource, Link, ProtocolKind};
use crate::utils::Metrics;

/// Notifications a participant's owner drains with [`Participant::fetch_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    ChannelCreated(Cid),
    ChannelDeleted(Cid),
    /// Domain notification forwarded by the owning layer.
    GroupUpdate(String),
}

/// Bytes per second moved during the last sampling period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthSample {
    pub sent: Bandwidth,
    pub received: Bandwidth,
}

/// Work for the send task of a framed transport.
#[derive(Debug)]
pub(crate) enum OutboundItem {
    Open { sid: Sid, params: StreamParams },
    Message { sid: Sid, payload: Bytes },
    Close(Sid),
}

enum Outbound {
    Queue(WaitQueue<OutboundItem>),
    Local(mpsc::UnboundedSender<LocalFrame>),
}

/// A message being reassembled from `Data` frames.
struct Partial {
    sid: Sid,
    length: u64,
    buf: BytesMut,
    started: Instant,
}

/// Stream ids the peer has opened so far. Ids below `floor` are all taken;
/// `above` only holds ids that arrived ahead of a gap.
#[derive(Debug)]
struct RemoteSids {
    floor: u64,
    above: BTreeSet<u64>,
}

impl RemoteSids {
    /// The peer allocates from the offset we did not get.
    fn for_local_offset(local: Sid) -> Self {
        let remote = if local == STREAM_ID_OFFSET1 {
            STREAM_ID_OFFSET2
        } else {
            STREAM_ID_OFFSET1
        };
        Self {
            floor: remote.value(),
            above: BTreeSet::new(),
        }
    }

    /// `false` if `sid` was opened before or lies outside the peer's range.
    fn insert(&mut self, sid: Sid) -> bool {
        let sid = sid.value();
        if sid < self.floor || !self.above.insert(sid) {
            return false;
        }
        while self.above.remove(&self.floor) {
            self.floor += 1;
        }
        true
    }
}

/// Everything a new participant needs besides its link.
pub(crate) struct ParticipantSetup {
    pub(crate) local_pid: Pid,
    pub(crate) outcome: HandshakeOutcome,
    pub(crate) protocol: ProtocolKind,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) config: Arc<NetworkConfig>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) struct ParticipantShared {
    local_pid: Pid,
    remote_pid: Pid,
    remote_secret: Secret,
    remote_version: [u32; 3],
    features: HandshakeFeatures,
    protocol: ProtocolKind,
    config: Arc<NetworkConfig>,
    metrics: Arc<Metrics>,

    next_sid: AtomicU64,
    next_cid: AtomicU64,
    streams: Mutex<HashMap<Sid, Arc<StreamShared>>>,
    remote_sids: Mutex<RemoteSids>,
    channels: Mutex<HashMap<Cid, Channel>>,
    incoming: WaitQueue<Stream>,

    events: Mutex<VecDeque<ParticipantEvent>>,
    event_signal: Semaphore,

    outbound: Outbound,
    quic: Option<(quinn::Connection, Option<quinn::Endpoint>)>,

    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    bandwidth: watch::Sender<BandwidthSample>,

    cancel: CancellationToken,
    sender_done: CancellationToken,
    disconnecting: AtomicBool,
    disconnected: watch::Sender<bool>,
}

impl ParticipantShared {
    fn next_sid(&self) -> Sid {
        Sid::new(self.next_sid.fetch_add(1, Ordering::AcqRel))
    }

    /// Queue work for the send task; `false` once the queue is closed.
    pub(crate) fn enqueue(&self, prio: Prio, item: OutboundItem) -> bool {
        match &self.outbound {
            Outbound::Queue(queue) => queue.push(prio, item),
            Outbound::Local(_) => false,
        }
    }

    fn enqueue_urgent(&self, item: OutboundItem) -> bool {
        match &self.outbound {
            Outbound::Queue(queue) => queue.push_urgent(item),
            Outbound::Local(_) => false,
        }
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.config.stream.max_message_size
    }

    pub(crate) fn record_sent(&self, bytes: u64) {
        self.metrics.message_sent(bytes);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: u64) {
        self.metrics.message_received(bytes);
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn push_event(&self, event: ParticipantEvent) {
        self.events.lock().push_back(event);
        self.event_signal.add_permits(1);
    }

    fn try_fetch_event(&self) -> Option<ParticipantEvent> {
        let permit = self.event_signal.try_acquire().ok()?;
        permit.forget();
        self.events.lock().pop_front()
    }

    fn add_channel(&self, channel: Channel) -> Cid {
        let cid = channel.cid();
        self.channels.lock().insert(cid, channel);
        self.metrics.channel_connected();
        self.push_event(ParticipantEvent::ChannelCreated(cid));
        cid
    }

    fn register(&self, stream: &Arc<StreamShared>) {
        self.streams.lock().insert(stream.sid, stream.clone());
        self.metrics.stream_opened();
    }

    /// Remove a closed stream. Its Sid stays used.
    fn forget_stream(&self, sid: Sid) {
        let removed = self.streams.lock().remove(&sid);
        if removed.is_some() {
            self.metrics.stream_closed();
            debug!(sid = %sid, "Stream closed");
        }
    }

    /// Register a stream the peer opened and queue it for [`Participant::opened`].
    fn accept_remote(
        self: &Arc<Self>,
        sid: Sid,
        params: StreamParams,
        inbox: crate::transport::mpsc::Inbox,
        backend: Backend,
    ) -> Option<Arc<StreamShared>> {
        if self.streams.lock().contains_key(&sid) || !self.remote_sids.lock().insert(sid) {
            trace!(sid = %sid, "Ignoring repeated OpenStream");
            return None;
        }
        let shared = Arc::new(StreamShared::new(
            sid,
            params,
            inbox,
            backend,
            self.config.stream.window,
        ));
        self.register(&shared);
        debug!(sid = %sid, prio = params.prio, promises = ?params.promises, "Remote opened stream");
        self.incoming
            .push(params.prio, Stream::new(shared.clone(), self.clone()));
        Some(shared)
    }

    /// The peer closed `sid`.
    fn remote_closed(&self, sid: Sid) {
        let stream = self.streams.lock().get(&sid).cloned();
        if let Some(stream) = stream {
            stream.mark_closed();
            self.finish_transport(&stream);
            stream.release();
            self.forget_stream(sid);
        }
    }

    /// Transport-specific part of closing a stream, without waiting on anything.
    fn finish_transport(&self, stream: &StreamShared) {
        match &stream.backend {
            Backend::Framed => {
                self.enqueue(LOWEST_PRIO, OutboundItem::Close(stream.sid));
            }
            Backend::Local { remote, tx } => {
                remote.close();
                let _ = tx.send(LocalFrame::Frame(OTFrame::CloseStream { sid: stream.sid }));
            }
            Backend::Quic { send } => {
                if let Ok(mut send) = send.try_lock() {
                    let _ = send.finish();
                }
            }
        }
    }

    /// Close a stream. A graceful close of a reliable stream first lets its
    /// messages in flight be acknowledged, then waits for the peer's echo.
    /// Both waits are bounded by the close timeout.
    pub(crate) async fn close_stream(&self, stream: &Arc<StreamShared>, graceful: bool) {
        if !stream.mark_closed() {
            return;
        }
        if let (true, Some(reliable)) = (graceful, &stream.reliable) {
            let timeout = self.config.stream.close_timeout;
            if tokio::time::timeout(timeout, reliable.in_flight.drained())
                .await
                .is_err()
            {
                debug!(
                    sid = %stream.sid,
                    in_flight = reliable.in_flight.len(),
                    "Closing with unacknowledged messages"
                );
            }
            // close traffic shares one bucket so it stays in order
            if let Some(close) = reliable.begin_close() {
                let sent = self.enqueue(
                    LOWEST_PRIO,
                    OutboundItem::Message {
                        sid: stream.sid,
                        payload: close,
                    },
                );
                if sent
                    && tokio::time::timeout(timeout, reliable.wait_close_ack())
                        .await
                        .is_err()
                {
                    self.metrics.close_timeout();
                    debug!(sid = %stream.sid, ?timeout, "Close not acknowledged in time");
                }
            }
        }
        if let Backend::Quic { send } = &stream.backend {
            let _ = send.lock().await.finish();
        } else {
            self.finish_transport(stream);
        }
        stream.release();
        self.forget_stream(stream.sid);
    }

    /// Synchronous close used when a [`Stream`] handle is dropped.
    pub(crate) fn dispose_stream(&self, stream: &Arc<StreamShared>) {
        if stream.mark_closed() {
            self.finish_transport(stream);
            stream.release();
            self.forget_stream(stream.sid);
        }
    }

    /// Route one reassembled payload to its stream.
    fn deliver(&self, sid: Sid, payload: Bytes) {
        let Some(stream) = self.streams.lock().get(&sid).cloned() else {
            trace!(sid = %sid, "Message for unknown stream");
            return;
        };
        match stream.receive(payload) {
            Ok(Inbound::Handled) => {}
            Ok(Inbound::Data { ack, ready, finish }) => {
                if let Some(ack) = ack {
                    self.enqueue_urgent(OutboundItem::Message { sid, payload: ack });
                }
                for payload in &ready {
                    self.record_received(payload.len() as u64);
                }
                stream.surface(ready);
                if let Some(echo) = finish {
                    self.finish_remote_close(&stream, echo);
                }
            }
            Ok(Inbound::RemoteClose { echo }) => self.finish_remote_close(&stream, echo),
            Err(e) => warn!(sid = %sid, error = %e, "Dropping malformed reliable payload"),
        }
    }

    /// Echo the peer's reliable close and drop the stream. Everything sent
    /// before the close has been surfaced.
    fn finish_remote_close(&self, stream: &Arc<StreamShared>, echo: Bytes) {
        let sid = stream.sid;
        debug!(sid = %sid, "Peer closed reliable stream");
        self.enqueue(LOWEST_PRIO, OutboundItem::Message { sid, payload: echo });
        stream.mark_closed();
        self.enqueue(LOWEST_PRIO, OutboundItem::Close(sid));
        stream.release();
        self.forget_stream(sid);
    }

    /// Handle one frame; `false` ends the receive task.
    fn handle_frame(
        self: &Arc<Self>,
        frame: ITFrame,
        assembly: &mut HashMap<Mid, Partial>,
    ) -> bool {
        match frame {
            ITFrame::Shutdown => {
                info!(remote = %self.remote_pid, "Peer shut down the connection");
                self.spawn_teardown(false);
                return false;
            }
            ITFrame::OpenStream {
                sid,
                prio,
                promises,
                guaranteed_bandwidth,
            } => {
                let params = StreamParams {
                    prio,
                    promises,
                    guaranteed_bandwidth,
                };
                self.accept_remote(sid, params, new_inbox(), Backend::Framed);
            }
            ITFrame::CloseStream { sid } => self.remote_closed(sid),
            ITFrame::DataHeader { mid, sid, length } => {
                // reliable streams wrap the message in a control envelope
                let limit = self.max_message_size().saturating_add(reliable::HEADER_LEN) as u64;
                if length == 0 {
                    self.deliver(sid, Bytes::new());
                } else if length > limit {
                    warn!(sid = %sid, length, limit, "Dropping message above the size limit");
                } else {
                    assembly.insert(
                        mid,
                        Partial {
                            sid,
                            length,
                            buf: BytesMut::with_capacity(length.min(1 << 20) as usize),
                            started: Instant::now(),
                        },
                    );
                }
            }
            ITFrame::Data { mid, data } => {
                let complete = match assembly.get_mut(&mid) {
                    Some(partial) => {
                        partial.buf.extend_from_slice(&data);
                        partial.buf.len() as u64 >= partial.length
                    }
                    None => {
                        trace!(mid, "Data for unknown message");
                        false
                    }
                };
                if complete {
                    if let Some(partial) = assembly.remove(&mid) {
                        self.deliver(partial.sid, partial.buf.freeze());
                    }
                }
            }
        }
        true
    }

    async fn send_loop(self: Arc<Self>, mut sink: FrameSink, chunk_size: usize) {
        let Outbound::Queue(queue) = &self.outbound else {
            return;
        };
        let mut next_mid: Mid = 0;
        let result: ParticipantResult<()> = async {
            loop {
                let item = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    item = queue.pop() => item,
                };
                let Some(item) = item else {
                    break;
                };
                match item {
                    OutboundItem::Open { sid, params } => {
                        sink.feed(OTFrame::OpenStream {
                            sid,
                            prio: params.prio,
                            promises: params.promises,
                            guaranteed_bandwidth: params.guaranteed_bandwidth,
                        })
                        .await?;
                    }
                    OutboundItem::Close(sid) => {
                        sink.feed(OTFrame::CloseStream { sid }).await?;
                    }
                    OutboundItem::Message { sid, payload } => {
                        let mid = next_mid;
                        next_mid += 1;
                        sink.feed(OTFrame::DataHeader {
                            mid,
                            sid,
                            length: payload.len() as u64,
                        })
                        .await?;
                        let mut offset = 0;
                        while offset < payload.len() {
                            let end = (offset + chunk_size).min(payload.len());
                            sink.feed(OTFrame::Data {
                                mid,
                                data: payload.slice(offset..end),
                            })
                            .await?;
                            offset = end;
                        }
                    }
                }
                if queue.is_empty() {
                    sink.flush().await?;
                }
            }
            // queue closed and drained
            sink.feed(OTFrame::Shutdown).await?;
            sink.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(remote = %self.remote_pid, error = %e, "Send task failed");
            self.spawn_teardown(false);
        }
        self.sender_done.cancel();
    }

    async fn recv_loop(self: Arc<Self>, mut source: FrameSource) {
        let ttl = self.config.participant.partial_message_ttl;
        let mut assembly: HashMap<Mid, Partial> = HashMap::new();
        let mut prune = tokio::time::interval(ttl);
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = prune.tick() => {
                    let before = assembly.len();
                    assembly.retain(|_, p| p.started.elapsed() < ttl);
                    if assembly.len() < before {
                        debug!(dropped = before - assembly.len(), "Dropped stale partial messages");
                    }
                    continue;
                }
                frame = source.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    if !self.handle_frame(frame, &mut assembly) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(remote = %self.remote_pid, error = %e, "Receive failed");
                    self.spawn_teardown(false);
                    break;
                }
                None => {
                    debug!(remote = %self.remote_pid, "Connection closed by peer");
                    self.spawn_teardown(false);
                    break;
                }
            }
        }
        self.release_handles();
    }

    async fn recv_local(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LocalFrame>) {
        let Outbound::Local(tx) = &self.outbound else {
            return;
        };
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = rx.recv() => frame,
            };
            match frame {
                Some(LocalFrame::OpenStream {
                    sid,
                    params,
                    to_opener,
                    to_acceptor,
                }) => {
                    let backend = Backend::Local {
                        remote: to_opener,
                        tx: tx.clone(),
                    };
                    self.accept_remote(sid, params, to_acceptor, backend);
                }
                Some(LocalFrame::Frame(OTFrame::CloseStream { sid })) => self.remote_closed(sid),
                Some(LocalFrame::Frame(OTFrame::Shutdown)) | None => {
                    debug!(remote = %self.remote_pid, "In-process peer went away");
                    self.spawn_teardown(false);
                    break;
                }
                Some(LocalFrame::Frame(other)) => {
                    warn!(frame = ?other, "Unexpected in-process frame");
                }
            }
        }
        self.release_handles();
    }

    async fn quic_accept_loop(self: Arc<Self>, connection: quinn::Connection) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = connection.accept_bi() => accepted,
            };
            let (send, mut recv) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "QUIC connection ended");
                    self.spawn_teardown(false);
                    break;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                let (sid, params) = match quic::read_open(&mut recv).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!(error = %e, "Invalid QUIC stream header");
                        return;
                    }
                };
                let backend = Backend::Quic {
                    send: tokio::sync::Mutex::new(send),
                };
                if let Some(stream) = this.accept_remote(sid, params, new_inbox(), backend) {
                    this.quic_reader(stream, recv).await;
                }
            });
        }
    }

    async fn quic_reader(self: Arc<Self>, stream: Arc<StreamShared>, mut recv: quinn::RecvStream) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = quic::read_message(&mut recv) => message,
            };
            match message {
                Ok(Some(envelope)) => {
                    self.record_received(envelope.len() as u64);
                    stream.inbox.push(stream.params.prio, envelope);
                }
                Ok(None) => {
                    trace!(sid = %stream.sid, "QUIC stream finished by peer");
                    self.remote_closed(stream.sid);
                    break;
                }
                Err(e) => {
                    debug!(sid = %stream.sid, error = %e, "QUIC stream failed");
                    self.remote_closed(stream.sid);
                    break;
                }
            }
        }
    }

    async fn resend_loop(self: Arc<Self>) {
        let retry = self.config.stream.retry_interval;
        let mut ticker = tokio::time::interval(retry);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let streams: Vec<Arc<StreamShared>> = self
                .streams
                .lock()
                .values()
                .filter(|s| s.reliable.is_some())
                .cloned()
                .collect();
            let now = Instant::now();
            for stream in streams {
                for (mid, encoded, prio) in stream.due(now, retry) {
                    trace!(sid = %stream.sid, mid, "Resending unacknowledged message");
                    self.metrics.resend();
                    self.enqueue(
                        prio,
                        OutboundItem::Message {
                            sid: stream.sid,
                            payload: encoded,
                        },
                    );
                }
            }
        }
    }

    async fn bandwidth_loop(self: Arc<Self>) {
        let period = self.config.participant.bandwidth_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let secs = period.as_secs_f64();
            let sample = BandwidthSample {
                sent: (self.sent_bytes.swap(0, Ordering::AcqRel) as f64 / secs) as Bandwidth,
                received: (self.received_bytes.swap(0, Ordering::AcqRel) as f64 / secs)
                    as Bandwidth,
            };
            self.metrics.bandwidth_sample(sample.sent);
            self.bandwidth.send_replace(sample);
        }
    }

    fn spawn_teardown(self: &Arc<Self>, graceful: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            this.teardown(graceful).await;
        });
    }

    /// Drop queued stream handles; they reference the participant.
    fn release_handles(&self) {
        self.incoming.close();
        drop(self.incoming.drain());
    }

    /// Tear the participant down; `false` if another call already did.
    #[instrument(skip_all, fields(remote = %self.remote_pid, graceful))]
    async fn teardown(self: &Arc<Self>, graceful: bool) -> bool {
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("Disconnecting participant");

        let streams: Vec<Arc<StreamShared>> = self.streams.lock().values().cloned().collect();
        join_all(streams.iter().map(|s| self.close_stream(s, graceful))).await;

        match &self.outbound {
            Outbound::Queue(queue) => {
                queue.close();
                if graceful {
                    let timeout = self.config.stream.close_timeout;
                    if tokio::time::timeout(timeout, self.sender_done.cancelled())
                        .await
                        .is_err()
                    {
                        debug!("Send queue not flushed before the close timeout");
                    }
                }
            }
            Outbound::Local(tx) => {
                let _ = tx.send(LocalFrame::Frame(OTFrame::Shutdown));
            }
        }

        self.cancel.cancel();
        if let Some((connection, _)) = &self.quic {
            connection.close(quinn::VarInt::from_u32(0), b"disconnect");
        }
        self.release_handles();
        self.streams.lock().clear();

        let channels: Vec<Cid> = self.channels.lock().drain().map(|(cid, _)| cid).collect();
        for cid in channels {
            self.metrics.channel_disconnected();
            self.push_event(ParticipantEvent::ChannelDeleted(cid));
        }

        self.metrics.participant_disconnected();
        self.disconnected.send_replace(true);
        true
    }
}

/// Handle to one connected remote peer. Cloning yields another handle to the
/// same participant.
#[derive(Clone)]
pub struct Participant {
    shared: Arc<ParticipantShared>,
}

impl Participant {
    /// Build the participant for a handshaken link and start its tasks.
    pub(crate) fn spawn(setup: ParticipantSetup, link: Link) -> Participant {
        let ParticipantSetup {
            local_pid,
            outcome,
            protocol,
            peer,
            config,
            metrics,
            cancel,
        } = setup;

        let (outbound, quic_conn) = match &link {
            Link::Local { tx, .. } => (Outbound::Local(tx.clone()), None),
            Link::Quic {
                connection,
                endpoint,
                ..
            } => (
                Outbound::Queue(WaitQueue::new()),
                Some((connection.clone(), endpoint.clone())),
            ),
            Link::Framed { .. } => (Outbound::Queue(WaitQueue::new()), None),
        };

        let shared = Arc::new(ParticipantShared {
            local_pid,
            remote_pid: outcome.remote_pid,
            remote_secret: outcome.remote_secret,
            remote_version: outcome.version,
            features: outcome.features,
            protocol,
            config: config.clone(),
            metrics: metrics.clone(),
            next_sid: AtomicU64::new(outcome.sid_offset.value()),
            next_cid: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
            remote_sids: Mutex::new(RemoteSids::for_local_offset(outcome.sid_offset)),
            channels: Mutex::new(HashMap::new()),
            incoming: WaitQueue::new(),
            events: Mutex::new(VecDeque::new()),
            event_signal: Semaphore::new(0),
            outbound,
            quic: quic_conn,
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            bandwidth: watch::channel(BandwidthSample::default()).0,
            cancel,
            sender_done: CancellationToken::new(),
            disconnecting: AtomicBool::new(false),
            disconnected: watch::channel(false).0,
        });

        shared.add_channel(Channel::new(0, protocol, peer));
        metrics.participant_connected();

        match link {
            Link::Framed {
                sink,
                source,
                chunk_size,
            } => {
                tokio::spawn(shared.clone().send_loop(sink, chunk_size));
                tokio::spawn(shared.clone().recv_loop(source));
                tokio::spawn(shared.clone().resend_loop());
            }
            Link::Local { rx, .. } => {
                shared.sender_done.cancel();
                tokio::spawn(shared.clone().recv_local(rx));
            }
            Link::Quic {
                connection,
                sink,
                source,
                ..
            } => {
                tokio::spawn(
                    shared
                        .clone()
                        .send_loop(sink, config.stream.max_chunk_size),
                );
                tokio::spawn(shared.clone().recv_loop(source));
                tokio::spawn(shared.clone().quic_accept_loop(connection));
            }
        }
        tokio::spawn(shared.clone().bandwidth_loop());

        info!(
            remote = %shared.remote_pid,
            protocol = %protocol,
            version = ?shared.remote_version,
            features = ?shared.features,
            "Participant connected"
        );
        Participant { shared }
    }

    pub fn local_pid(&self) -> Pid {
        self.shared.local_pid
    }

    pub fn remote_pid(&self) -> Pid {
        self.shared.remote_pid
    }

    /// Network version agreed on during the handshake.
    pub fn remote_version(&self) -> [u32; 3] {
        self.shared.remote_version
    }

    /// Negotiated features, the intersection of both sides' declarations.
    pub fn features(&self) -> HandshakeFeatures {
        self.shared.features
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.shared.protocol
    }

    pub(crate) fn remote_secret(&self) -> Secret {
        self.shared.remote_secret
    }

    /// Whether both handles refer to the same participant.
    pub(crate) fn same(&self, other: &Participant) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Allocate the next stream id. Ids are never reused.
    pub fn next_sid(&self) -> Sid {
        self.shared.next_sid()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    pub fn has_stream(&self, sid: Sid) -> bool {
        self.shared.streams.lock().contains_key(&sid)
    }

    /// Open a new stream to the peer.
    ///
    /// # Errors
    /// `ParticipantDisconnected` once the participant is torn down
    #[instrument(skip(self), fields(remote = %self.shared.remote_pid))]
    pub async fn open(&self, params: StreamParams) -> ParticipantResult<Stream> {
        let shared = &self.shared;
        if shared.disconnecting.load(Ordering::Acquire) {
            return Err(ParticipantError::ParticipantDisconnected);
        }
        let sid = shared.next_sid();
        let window = shared.config.stream.window;
        let inbox = new_inbox();

        let stream = match (&shared.outbound, &shared.quic) {
            (_, Some((connection, _))) => {
                let (mut send, recv) = connection
                    .open_bi()
                    .await
                    .map_err(|_| ParticipantError::ParticipantDisconnected)?;
                quic::write_open(&mut send, sid, &params).await?;
                let backend = Backend::Quic {
                    send: tokio::sync::Mutex::new(send),
                };
                let stream = Arc::new(StreamShared::new(sid, params, inbox, backend, window));
                tokio::spawn(shared.clone().quic_reader(stream.clone(), recv));
                stream
            }
            (Outbound::Local(tx), None) => {
                let remote = new_inbox();
                tx.send(LocalFrame::OpenStream {
                    sid,
                    params,
                    to_opener: inbox.clone(),
                    to_acceptor: remote.clone(),
                })
                .map_err(|_| ParticipantError::ParticipantDisconnected)?;
                let backend = Backend::Local {
                    remote,
                    tx: tx.clone(),
                };
                Arc::new(StreamShared::new(sid, params, inbox, backend, window))
            }
            (Outbound::Queue(queue), None) => {
                if !queue.push_urgent(OutboundItem::Open { sid, params }) {
                    return Err(ParticipantError::ParticipantDisconnected);
                }
                Arc::new(StreamShared::new(sid, params, inbox, Backend::Framed, window))
            }
        };
        shared.register(&stream);
        debug!(sid = %sid, prio = params.prio, promises = ?params.promises, "Stream opened");
        Ok(Stream::new(stream, shared.clone()))
    }

    /// Wait for the next stream the peer opened. Streams opened in a burst are
    /// handed out by priority.
    ///
    /// # Errors
    /// `ParticipantDisconnected` once the participant is torn down
    pub async fn opened(&self) -> ParticipantResult<Stream> {
        self.shared
            .incoming
            .pop()
            .await
            .ok_or(ParticipantError::ParticipantDisconnected)
    }

    /// A remotely opened stream, if one is waiting.
    pub fn try_opened(&self) -> Option<Stream> {
        self.shared.incoming.try_pop()
    }

    /// Wait for the next event.
    ///
    /// # Errors
    /// `ParticipantDisconnected` once the participant is torn down and no
    /// events are left
    pub async fn fetch_event(&self) -> ParticipantResult<ParticipantEvent> {
        let shared = &self.shared;
        tokio::select! {
            biased;
            permit = shared.event_signal.acquire() => {
                permit
                    .map_err(|_| ParticipantError::ParticipantDisconnected)?
                    .forget();
                shared
                    .events
                    .lock()
                    .pop_front()
                    .ok_or(ParticipantError::ParticipantDisconnected)
            }
            _ = shared.cancel.cancelled() => shared
                .try_fetch_event()
                .ok_or(ParticipantError::ParticipantDisconnected),
        }
    }

    pub fn try_fetch_event(&self) -> Option<ParticipantEvent> {
        self.shared.try_fetch_event()
    }

    /// Append a domain event to the FIFO.
    pub fn push_event(&self, event: ParticipantEvent) {
        self.shared.push_event(event);
    }

    /// Register another bookkeeping channel; the channel's id is replaced by a
    /// fresh one.
    pub fn add_channel(&self, protocol: ProtocolKind, peer: Option<SocketAddr>) -> Cid {
        let cid = self.shared.next_cid.fetch_add(1, Ordering::AcqRel);
        self.shared.add_channel(Channel::new(cid, protocol, peer))
    }

    pub fn remove_channel(&self, cid: Cid) -> Option<ChannelInfo> {
        let channel = self.shared.channels.lock().remove(&cid)?;
        self.shared.metrics.channel_disconnected();
        self.shared.push_event(ParticipantEvent::ChannelDeleted(cid));
        Some(channel.info().clone())
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        let mut channels: Vec<ChannelInfo> = self
            .shared
            .channels
            .lock()
            .values()
            .map(|c| c.info().clone())
            .collect();
        channels.sort_by_key(|c| c.cid);
        channels
    }

    /// Bandwidth samples, updated once per sampling period.
    pub fn bandwidth(&self) -> watch::Receiver<BandwidthSample> {
        self.shared.bandwidth.subscribe()
    }

    /// Close every stream, tell the peer and release the connection.
    ///
    /// # Errors
    /// `ParticipantDisconnected` if the participant was already torn down
    pub async fn disconnect(&self) -> ParticipantResult<()> {
        if self.shared.teardown(true).await {
            Ok(())
        } else {
            self.disconnected().await;
            Err(ParticipantError::ParticipantDisconnected)
        }
    }

    /// Resolves once the participant is torn down.
    pub async fn disconnected(&self) {
        let mut rx = self.shared.disconnected.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_disconnected(&self) -> bool {
        *self.shared.disconnected.borrow()
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("local", &self.shared.local_pid)
            .field("remote", &self.shared.remote_pid)
            .field("protocol", &self.shared.protocol)
            .field("streams", &self.stream_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::core::types::{Promises, STREAM_ID_OFFSET1, STREAM_ID_OFFSET2};
    use crate::transport::{BoxedRead, BoxedWrite};
    use tokio::io::duplex;

    fn setup(sid_offset: Sid, remote: u128, config: Arc<NetworkConfig>) -> ParticipantSetup {
        ParticipantSetup {
            local_pid: Pid::fake(remote ^ 0xff),
            outcome: HandshakeOutcome {
                remote_pid: Pid::fake(remote),
                remote_secret: Secret::from_bytes([7; 16]),
                features: HandshakeFeatures::all(),
                version: crate::core::types::VELOREN_NETWORK_VERSION,
                legacy: false,
                sid_offset,
            },
            protocol: ProtocolKind::Tcp,
            peer: None,
            config,
            metrics: Arc::new(Metrics::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn framed_pair(config: Arc<NetworkConfig>) -> (Participant, Participant) {
        let (a, b) = duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let a_link = Link::byte_stream(Box::new(ar) as BoxedRead, Box::new(aw) as BoxedWrite, 1024);
        let b_link = Link::byte_stream(Box::new(br) as BoxedRead, Box::new(bw) as BoxedWrite, 1024);
        (
            Participant::spawn(setup(STREAM_ID_OFFSET1, 2, config.clone()), a_link),
            Participant::spawn(setup(STREAM_ID_OFFSET2, 1, config), b_link),
        )
    }

    #[tokio::test]
    async fn test_framed_stream_roundtrip_with_chunking() {
        let (a, b) = framed_pair(Arc::new(NetworkConfig::default()));
        let stream = a.open(StreamParams::new(Promises::ORDERED)).await.unwrap();
        assert_eq!(stream.sid(), STREAM_ID_OFFSET1);

        let big = vec![42u8; 5000];
        stream.send(&big).await.unwrap();
        stream.send("after").await.unwrap();

        let remote = b.opened().await.unwrap();
        assert_eq!(remote.sid(), STREAM_ID_OFFSET1);
        assert_eq!(remote.recv::<Vec<u8>>().await.unwrap(), big);
        assert_eq!(remote.recv::<String>().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_sids_never_reused() {
        let (a, _b) = framed_pair(Arc::new(NetworkConfig::default()));
        let first = a.open(StreamParams::default()).await.unwrap();
        let sid = first.sid();
        first.close().await;
        let second = a.open(StreamParams::default()).await.unwrap();
        assert_ne!(second.sid(), sid);
        assert_eq!(second.sid().value(), sid.value() + 1);
    }

    #[tokio::test]
    async fn test_remote_streams_admitted_by_priority() {
        let (a, b) = framed_pair(Arc::new(NetworkConfig::default()));
        let low = a
            .open(StreamParams::new(Promises::ORDERED).with_prio(6))
            .await
            .unwrap();
        let high = a
            .open(StreamParams::new(Promises::ORDERED).with_prio(0))
            .await
            .unwrap();

        // wait until both OpenStream frames arrived before accepting
        tokio::time::timeout(Duration::from_secs(5), async {
            while b.shared.incoming.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(b.opened().await.unwrap().sid(), high.sid());
        assert_eq!(b.opened().await.unwrap().sid(), low.sid());
    }

    #[tokio::test]
    async fn test_reliable_close_is_acknowledged_and_idempotent() {
        let (a, b) = framed_pair(Arc::new(NetworkConfig::default()));
        let stream = a
            .open(StreamParams::new(
                Promises::ORDERED | Promises::GUARANTEED_DELIVERY,
            ))
            .await
            .unwrap();
        stream.send(&1u32).await.unwrap();
        let remote = b.opened().await.unwrap();
        assert_eq!(remote.recv::<u32>().await.unwrap(), 1);

        let started = Instant::now();
        stream.close().await;
        stream.close().await;
        assert!(started.elapsed() < NetworkConfig::default().stream.close_timeout);
        assert!(stream.is_closed());
        assert!(matches!(
            stream.send(&2u32).await,
            Err(crate::error::StreamError::StreamClosed)
        ));
        assert!(remote.recv::<u32>().await.is_err());
        assert_eq!(stream.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reliable_close_waits_for_lower_prio_messages() {
        let (a, b) = framed_pair(Arc::new(NetworkConfig::default()));
        let stream = a
            .open(StreamParams::new(Promises::GUARANTEED_DELIVERY).with_prio(0))
            .await
            .unwrap();
        stream.send_with_prio(&7u32, 7).await.unwrap();
        stream.send_with_prio(&3u32, 3).await.unwrap();
        stream.close().await;
        assert_eq!(stream.in_flight(), 0);

        let remote = b.opened().await.unwrap();
        let mut got = vec![
            remote.recv::<u32>().await.unwrap(),
            remote.recv::<u32>().await.unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![3, 7]);
        assert!(matches!(
            remote.recv::<u32>().await,
            Err(crate::error::StreamError::StreamClosed)
        ));
        assert_eq!(a.shared.metrics.close_timeouts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_oversized_messages_are_refused() {
        let config = Arc::new(NetworkConfig::default_with_overrides(|c| {
            c.stream.max_message_size = 32;
        }));
        let (a, b) = framed_pair(config);
        let stream = a.open(StreamParams::default()).await.unwrap();
        assert!(matches!(
            stream.send(&vec![0u8; 64]).await,
            Err(crate::error::StreamError::MessageTooLarge { max: 32, .. })
        ));
        stream.send(&1u8).await.unwrap();
        let remote = b.opened().await.unwrap();
        assert_eq!(remote.recv::<u8>().await.unwrap(), 1);

        let mut assembly = HashMap::new();
        b.shared.handle_frame(
            ITFrame::DataHeader {
                mid: 99,
                sid: remote.sid(),
                length: u64::MAX,
            },
            &mut assembly,
        );
        assert!(assembly.is_empty());
        b.shared.handle_frame(
            ITFrame::DataHeader {
                mid: 100,
                sid: remote.sid(),
                length: 16,
            },
            &mut assembly,
        );
        assert_eq!(assembly.len(), 1);
    }

    #[test]
    fn test_remote_sids_stay_compact() {
        let mut seen = RemoteSids::for_local_offset(STREAM_ID_OFFSET2);
        assert_eq!(seen.floor, STREAM_ID_OFFSET1.value());
        for sid in 0..1000 {
            assert!(seen.insert(Sid::new(sid)));
        }
        assert!(seen.above.is_empty());
        assert!(!seen.insert(Sid::new(10)));

        assert!(seen.insert(Sid::new(1002)));
        assert!(!seen.insert(Sid::new(1002)));
        assert_eq!(seen.above.len(), 1);
        assert!(seen.insert(Sid::new(1001)));
        assert!(seen.insert(Sid::new(1000)));
        assert!(seen.above.is_empty());
        assert_eq!(seen.floor, 1003);

        let mut initiator = RemoteSids::for_local_offset(STREAM_ID_OFFSET1);
        assert!(!initiator.insert(STREAM_ID_OFFSET1));
        assert!(initiator.insert(STREAM_ID_OFFSET2));
    }

    #[tokio::test]
    async fn test_closed_remote_stream_is_not_reopened() {
        let (a, b) = framed_pair(Arc::new(NetworkConfig::default()));
        let stream = a.open(StreamParams::default()).await.unwrap();
        let sid = stream.sid();
        let remote = b.opened().await.unwrap();
        remote.close().await;
        assert_eq!(b.stream_count(), 0);

        let mut assembly = HashMap::new();
        b.shared.handle_frame(
            ITFrame::OpenStream {
                sid,
                prio: 0,
                promises: Promises::empty(),
                guaranteed_bandwidth: 0,
            },
            &mut assembly,
        );
        assert_eq!(b.stream_count(), 0);
        assert!(b.try_opened().is_none());
    }

    #[tokio::test]
    async fn test_lost_reliable_message_is_resent() {
        let config = Arc::new(NetworkConfig::default_with_overrides(|c| {
            c.stream.retry_interval = Duration::from_millis(50);
        }));
        let (a_io, relay_a) = duplex(1 << 16);
        let (b_io, relay_b) = duplex(1 << 16);
        tokio::spawn(lossy_relay(relay_a, relay_b));

        let (ar, aw) = tokio::io::split(a_io);
        let (br, bw) = tokio::io::split(b_io);
        let a = Participant::spawn(
            setup(STREAM_ID_OFFSET1, 2, config.clone()),
            Link::byte_stream(Box::new(ar), Box::new(aw), 1024),
        );
        let b = Participant::spawn(
            setup(STREAM_ID_OFFSET2, 1, config),
            Link::byte_stream(Box::new(br), Box::new(bw), 1024),
        );

        let stream = a
            .open(StreamParams::new(
                Promises::ORDERED | Promises::GUARANTEED_DELIVERY,
            ))
            .await
            .unwrap();
        stream.send("survives").await.unwrap();
        let remote = b.opened().await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), remote.recv::<String>())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "survives");

        tokio::time::timeout(Duration::from_secs(5), async {
            while stream.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(a.shared.metrics.resends.load(Ordering::Relaxed) >= 1);
    }

    /// Forward frames between two pipes, dropping the first `Data` frame
    /// travelling from `a` to `b`.
    async fn lossy_relay(a: tokio::io::DuplexStream, b: tokio::io::DuplexStream) {
        use crate::core::codec::FrameCodec;
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::{FramedRead, FramedWrite};

        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let forward = async move {
            let mut from = FramedRead::new(ar, FrameCodec);
            let mut to = FramedWrite::new(bw, FrameCodec);
            let mut dropped = false;
            while let Some(Ok(frame)) = from.next().await {
                if !dropped && matches!(frame, ITFrame::Data { .. }) {
                    dropped = true;
                    continue;
                }
                if to.send(relay(frame)).await.is_err() {
                    break;
                }
            }
        };
        let backward = async move {
            let mut from = FramedRead::new(br, FrameCodec);
            let mut to = FramedWrite::new(aw, FrameCodec);
            while let Some(Ok(frame)) = from.next().await {
                if to.send(relay(frame)).await.is_err() {
                    break;
                }
            }
        };
        tokio::join!(forward, backward);
    }

    fn relay(frame: ITFrame) -> OTFrame {
        match frame {
            ITFrame::Shutdown => OTFrame::Shutdown,
            ITFrame::OpenStream {
                sid,
                prio,
                promises,
                guaranteed_bandwidth,
            } => OTFrame::OpenStream {
                sid,
                prio,
                promises,
                guaranteed_bandwidth,
            },
            ITFrame::CloseStream { sid } => OTFrame::CloseStream { sid },
            ITFrame::DataHeader { mid, sid, length } => OTFrame::DataHeader { mid, sid, length },
            ITFrame::Data { mid, data } => OTFrame::Data { mid, data },
        }
    }

    #[tokio::test]
    async fn test_disconnect_fires_once_and_closes_streams() {
        let (a, b) = framed_pair(Arc::new(NetworkConfig::default()));
        let stream = a.open(StreamParams::default()).await.unwrap();
        assert_eq!(
            a.try_fetch_event(),
            Some(ParticipantEvent::ChannelCreated(0))
        );

        a.disconnect().await.unwrap();
        assert!(a.is_disconnected());
        assert!(matches!(
            a.disconnect().await,
            Err(ParticipantError::ParticipantDisconnected)
        ));
        assert!(stream.is_closed());
        assert_eq!(a.stream_count(), 0);
        assert_eq!(
            a.fetch_event().await.unwrap(),
            ParticipantEvent::ChannelDeleted(0)
        );
        assert!(a.open(StreamParams::default()).await.is_err());

        tokio::time::timeout(Duration::from_secs(5), b.disconnected())
            .await
            .unwrap();
        assert!(b.opened().await.is_err() || b.is_disconnected());
    }

    #[tokio::test]
    async fn test_events_are_fifo() {
        let (a, _b) = framed_pair(Arc::new(NetworkConfig::default()));
        assert_eq!(
            a.fetch_event().await.unwrap(),
            ParticipantEvent::ChannelCreated(0)
        );
        a.push_event(ParticipantEvent::GroupUpdate("red".into()));
        let cid = a.add_channel(ProtocolKind::Udp, None);
        assert_eq!(
            a.fetch_event().await.unwrap(),
            ParticipantEvent::GroupUpdate("red".into())
        );
        assert_eq!(
            a.fetch_event().await.unwrap(),
            ParticipantEvent::ChannelCreated(cid)
        );
        assert!(a.try_fetch_event().is_none());
        assert_eq!(a.channels().len(), 2);
        assert_eq!(a.remove_channel(cid).unwrap().protocol, ProtocolKind::Udp);
        assert_eq!(
            a.try_fetch_event(),
            Some(ParticipantEvent::ChannelDeleted(cid))
        );
    }

    #[tokio::test]
    async fn test_bandwidth_sampled() {
        let config = Arc::new(NetworkConfig::default_with_overrides(|c| {
            c.participant.bandwidth_interval = Duration::from_millis(100);
        }));
        let (a, _b) = framed_pair(config);
        let mut samples = a.bandwidth();
        let stream = a.open(StreamParams::default()).await.unwrap();
        stream.send(&vec![0u8; 1000]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                samples.changed().await.unwrap();
                if samples.borrow().sent > 0 {
                    break;
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_received_bytes_counted_on_arrival() {
        let config = Arc::new(NetworkConfig::default_with_overrides(|c| {
            c.participant.bandwidth_interval = Duration::from_millis(100);
        }));
        let (a, b) = framed_pair(config);
        let mut samples = b.bandwidth();
        let stream = a.open(StreamParams::default()).await.unwrap();
        stream.send(&vec![0u8; 1000]).await.unwrap();

        // nothing reads the stream on `b`
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                samples.changed().await.unwrap();
                if samples.borrow().received > 0 {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(b.shared.metrics.messages_received.load(Ordering::Relaxed), 1);
        assert!(b.shared.metrics.bytes_received.load(Ordering::Relaxed) >= 1000);
    }
}
