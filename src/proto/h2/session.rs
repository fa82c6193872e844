//! The HTTP/2 session: frame dispatch, stream bookkeeping, response tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use http::StatusCode;
use tokio::io::WriteHalf;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::body::{Body, Trailers};
use crate::common::exec::Exec;
use crate::common::BoxIo;
use crate::error::Error;
use crate::service::HttpService;
use crate::{Request, Response};

use super::codec::{FramedRead, FrameWriter};
use super::flow::{RecvWindow, SendWindow};
use super::frame::{
    self, Continuation, Data, GoAway, Head, Headers, Kind, Ping, Priority, Reset,
    Settings, WindowUpdate,
};
use super::hpack;
use super::scheduler::{PriorityLock, PRIORITY_MAX};
use super::streams::{self, Stream, StreamState};
use super::Reason;

/// Cap on an accumulated header block across CONTINUATION frames.
const MAX_HEADER_BLOCK: usize = 1024 * 1024;

/// Tuning for the HTTP/2 connection handler; these become the server's
/// SETTINGS frame.
#[derive(Clone, Debug)]
pub struct Http2Config {
    pub header_table_size: u32,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Http2Config {
    fn default() -> Http2Config {
        Http2Config {
            header_table_size: frame::DEFAULT_HEADER_TABLE_SIZE,
            max_concurrent_streams: 128,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: 16_384,
        }
    }
}

impl Http2Config {
    fn to_settings(&self) -> Settings {
        Settings {
            header_table_size: Some(self.header_table_size),
            enable_push: Some(0),
            max_concurrent_streams: Some(self.max_concurrent_streams),
            initial_window_size: Some(self.initial_window_size),
            max_frame_size: Some(self.max_frame_size),
            max_header_list_size: Some(self.max_header_list_size),
            ..Settings::default()
        }
    }
}

type SharedWriter = Arc<PriorityLock<FrameWriter<WriteHalf<BoxIo>>>>;

/// Peer-advertised limits shared with response tasks.
struct PeerLimits {
    max_frame_size: AtomicU32,
}

struct Session {
    service: Arc<HttpService>,
    exec: Exec,
    config: Http2Config,
    writer: SharedWriter,
    hpack_dec: hpack::Decoder,
    streams: HashMap<u32, Stream>,
    /// Highest stream id that has left IDLE; later frames for lower
    /// unknown ids violate the monotonicity rule.
    highest_stream_id: u32,
    /// Stream with an unterminated header block; until its CONTINUATION
    /// with END_HEADERS arrives no other frame is legal.
    expect_continuation: Option<u32>,
    goaway_received: bool,
    peer_initial_window: u32,
    limits: Arc<PeerLimits>,
    conn_send_window: Arc<SendWindow>,
    conn_recv_window: RecvWindow,
    active: Arc<AtomicUsize>,
    aborted: watch::Receiver<bool>,
}

/// Serves one HTTP/2 session until the peer goes away or a connection
/// error forces a GOAWAY. `seeded_settings` carries the payload of an
/// `HTTP2-Settings` upgrade header.
pub(crate) async fn serve(
    io: BoxIo,
    service: Arc<HttpService>,
    config: &Http2Config,
    exec: Exec,
    seeded_settings: Option<Bytes>,
) -> crate::Result<()> {
    let (read_half, write_half) = tokio::io::split(io);
    let mut reader = FramedRead::new(read_half);
    let writer: SharedWriter = Arc::new(PriorityLock::new(FrameWriter::new(
        write_half,
        frame::DEFAULT_HEADER_TABLE_SIZE,
    )));
    let (aborted_tx, aborted_rx) = watch::channel(false);

    let mut session = Session {
        service,
        exec,
        config: config.clone(),
        writer: writer.clone(),
        hpack_dec: hpack::Decoder::new(config.header_table_size as usize),
        streams: HashMap::new(),
        highest_stream_id: 0,
        expect_continuation: None,
        goaway_received: false,
        peer_initial_window: frame::DEFAULT_INITIAL_WINDOW_SIZE,
        limits: Arc::new(PeerLimits {
            max_frame_size: AtomicU32::new(frame::DEFAULT_MAX_FRAME_SIZE),
        }),
        conn_send_window: Arc::new(SendWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE)),
        conn_recv_window: RecvWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
        active: Arc::new(AtomicUsize::new(0)),
        aborted: aborted_rx,
    };

    // The server speaks first: its SETTINGS frame.
    {
        let settings = session.config.to_settings();
        let mut guard = writer.lock(PRIORITY_MAX).await;
        guard.send(|buf| settings.encode(buf)).await?;
    }

    let result = run(&mut reader, &mut session, seeded_settings).await;

    let outcome = match result {
        Ok(()) => Ok(()),
        Err(err) => match err.h2_reason() {
            Some(reason) => {
                debug!("http2 connection error: {:?} ({})", reason, err);
                let last = session.highest_stream_id;
                let mut guard = writer.lock(PRIORITY_MAX).await;
                let _ = guard.send(|buf| GoAway::new(last, reason).encode(buf)).await;
                Ok(())
            }
            None if err.is_broken_pipe() => Ok(()),
            None => Err(err),
        },
    };

    // Closing the connection aborts every stream; parked tasks wake and
    // observe the terminal state.
    session.abort_streams();
    let _ = aborted_tx.send(true);
    outcome
}

async fn run(
    reader: &mut FramedRead<tokio::io::ReadHalf<BoxIo>>,
    session: &mut Session,
    seeded_settings: Option<Bytes>,
) -> crate::Result<()> {
    if let Some(payload) = seeded_settings {
        let settings = Settings::parse_payload(&payload)?;
        session.apply_peer_settings(settings).await?;
    }

    reader.read_preface().await?;

    loop {
        match reader.read_frame(session.config.max_frame_size).await? {
            Some((head, payload)) => session.on_frame(head, payload).await?,
            None => return Ok(()),
        }
    }
}

fn conn_error(reason: Reason, message: &'static str) -> Error {
    Error::new_h2_connection(reason, message)
}

impl Session {
    async fn on_frame(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        // Between a HEADERS frame without END_HEADERS and its final
        // CONTINUATION, nothing else may appear on the wire.
        if let Some(cont) = self.expect_continuation {
            if head.kind != Kind::Continuation || head.stream_id != cont {
                return Err(conn_error(
                    Reason::PROTOCOL_ERROR,
                    "frame interleaved an open header block",
                ));
            }
        }

        match head.kind {
            Kind::Settings => self.on_settings(head, payload).await,
            Kind::Ping => self.on_ping(head, payload).await,
            Kind::GoAway => self.on_go_away(head, payload),
            Kind::WindowUpdate => self.on_window_update(head, payload).await,
            Kind::Data => self.on_data(head, payload).await,
            Kind::Headers => self.on_headers(head, payload).await,
            Kind::Continuation => self.on_continuation(head, payload).await,
            Kind::Priority => self.on_priority(head, payload),
            Kind::Reset => self.on_reset(head, payload),
            Kind::PushPromise => Err(conn_error(
                Reason::PROTOCOL_ERROR,
                "PUSH_PROMISE from a client",
            )),
            Kind::Unknown(kind) => {
                trace!("ignoring unknown frame type {}", kind);
                Ok(())
            }
        }
    }

    async fn send_control<F>(&self, encode: F) -> crate::Result<()>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut guard = self.writer.lock(PRIORITY_MAX).await;
        guard.send(encode).await
    }

    /// Resets a stream and reports the error to the peer.
    async fn reset_stream(
        &mut self,
        id: u32,
        reason: Reason,
        message: &'static str,
    ) -> crate::Result<()> {
        debug!("stream {} error: {:?} ({})", id, reason, message);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.abort(StreamState::Error);
        }
        self.send_control(|buf| Reset::new(id, reason).encode(buf)).await
    }

    async fn on_settings(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let settings = Settings::parse(head, payload)?;
        if settings.is_ack() {
            trace!("peer acknowledged settings");
            return Ok(());
        }
        self.apply_peer_settings(settings).await?;
        self.send_control(|buf| Settings::ack().encode(buf)).await
    }

    async fn apply_peer_settings(&mut self, settings: Settings) -> crate::Result<()> {
        if let Some(size) = settings.header_table_size {
            let mut guard = self.writer.lock(PRIORITY_MAX).await;
            guard.hpack.set_max_size(size as usize);
        }
        if let Some(size) = settings.max_frame_size {
            self.limits.max_frame_size.store(size, Ordering::SeqCst);
        }
        if let Some(initial) = settings.initial_window_size {
            // A mid-session change applies as a signed delta to every
            // open stream's window; the connection window is untouched.
            let delta = initial as i64 - self.peer_initial_window as i64;
            self.peer_initial_window = initial;
            if delta != 0 {
                for stream in self.streams.values() {
                    if !stream.state.is_terminal() {
                        stream.send_window.add(delta)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_ping(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let ping = Ping::parse(head, payload)?;
        if ping.ack {
            return Ok(());
        }
        self.send_control(|buf| Ping::pong(ping.payload).encode(buf)).await
    }

    fn on_go_away(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let goaway = GoAway::parse(head, payload)?;
        debug!(
            "received GOAWAY: last_stream={}, code={:?}",
            goaway.last_stream_id, goaway.error_code
        );
        self.goaway_received = true;
        Ok(())
    }

    async fn on_window_update(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let update = WindowUpdate::parse(head, payload)?;
        if update.stream_id == 0 {
            if update.increment == 0 {
                return Err(conn_error(
                    Reason::PROTOCOL_ERROR,
                    "connection WINDOW_UPDATE with increment 0",
                ));
            }
            return self.conn_send_window.add(update.increment as i64);
        }

        if !self.streams.contains_key(&update.stream_id) {
            if update.stream_id > self.highest_stream_id {
                return Err(conn_error(
                    Reason::PROTOCOL_ERROR,
                    "WINDOW_UPDATE on an idle stream",
                ));
            }
            return Ok(());
        }
        if update.increment == 0 {
            return self
                .reset_stream(
                    update.stream_id,
                    Reason::PROTOCOL_ERROR,
                    "stream WINDOW_UPDATE with increment 0",
                )
                .await;
        }
        let overflow = {
            let stream = self.streams.get(&update.stream_id).expect("checked");
            stream.send_window.add(update.increment as i64).is_err()
        };
        if overflow {
            return self
                .reset_stream(
                    update.stream_id,
                    Reason::FLOW_CONTROL_ERROR,
                    "stream window overflow",
                )
                .await;
        }
        Ok(())
    }

    async fn on_data(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let data = Data::parse(head, payload)?;
        let id = data.stream_id;

        // Padding and payload both count against the connection window,
        // which is replenished as soon as the bytes are buffered.
        self.conn_recv_window.consume(data.flow_len)?;
        self.conn_recv_window.replenish(data.flow_len);

        let (end_stream, stream_window_blown) = {
            let stream = match self.streams.get_mut(&id) {
                Some(stream) => stream,
                None if id > self.highest_stream_id => {
                    return Err(conn_error(
                        Reason::PROTOCOL_ERROR,
                        "DATA on an idle stream",
                    ));
                }
                None => {
                    return Err(conn_error(
                        Reason::STREAM_CLOSED,
                        "DATA for an untracked stream",
                    ));
                }
            };
            match stream.state {
                StreamState::Payload => (),
                state if state.is_half_closed() => {
                    return Err(conn_error(
                        Reason::STREAM_CLOSED,
                        "DATA for a half-closed stream",
                    ));
                }
                state if state.is_terminal() => {
                    // Frames racing a reset are counted but dropped.
                    return Ok(());
                }
                _ => {
                    return Err(conn_error(
                        Reason::PROTOCOL_ERROR,
                        "DATA before the header block completed",
                    ));
                }
            }
            if stream.recv_window.consume(data.flow_len).is_err() {
                (data.end_stream, true)
            } else {
                stream.recv_window.replenish(data.flow_len);
                stream.body.extend_from_slice(&data.data);
                (data.end_stream, false)
            }
        };

        if stream_window_blown {
            return self
                .reset_stream(id, Reason::FLOW_CONTROL_ERROR, "stream window overrun")
                .await;
        }

        if data.flow_len > 0 {
            let flow = data.flow_len;
            self.send_control(|buf| WindowUpdate::new(0, flow).encode(buf)).await?;
            if !end_stream {
                self.send_control(|buf| WindowUpdate::new(id, flow).encode(buf))
                    .await?;
            }
        }

        if end_stream {
            self.dispatch(id).await?;
        }
        Ok(())
    }

    async fn on_headers(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let headers = Headers::parse(head, payload)?;
        let id = headers.stream_id;
        if id % 2 == 0 {
            return Err(conn_error(
                Reason::PROTOCOL_ERROR,
                "client-initiated stream with an even id",
            ));
        }

        if !self.streams.contains_key(&id) {
            // A new stream id must be strictly greater than every id
            // seen so far.
            if id <= self.highest_stream_id {
                return Err(conn_error(
                    Reason::PROTOCOL_ERROR,
                    "new stream id is not increasing",
                ));
            }
            self.highest_stream_id = id;

            let mut stream = Stream::new(
                id,
                self.peer_initial_window,
                self.config.initial_window_size,
                headers.weight.unwrap_or(16),
            );
            // After a GOAWAY no new streams may open: existing streams
            // drain, and anything the peer opens anyway is refused.
            if self.goaway_received {
                trace!("refusing stream {} opened after GOAWAY", id);
                stream.refused = true;
            } else {
                stream.refused = self.active.load(Ordering::SeqCst)
                    >= self.config.max_concurrent_streams as usize;
            }
            stream.end_stream = headers.end_stream;
            stream.header_block.extend_from_slice(&headers.fragment);
            self.streams.insert(id, stream);

            if headers.end_headers {
                return self.finish_header_block(id).await;
            }
            self.expect_continuation = Some(id);
            return Ok(());
        }

        // HEADERS for an existing stream: trailers, or a violation.
        enum Disposition {
            Trailers { end_headers: bool },
            HalfClosed,
            Terminal,
            Unexpected,
            MissingEndStream,
        }
        let disposition = {
            let stream = self.streams.get_mut(&id).expect("checked");
            match stream.state {
                StreamState::Payload if !headers.end_stream => Disposition::MissingEndStream,
                StreamState::Payload => {
                    stream.end_stream = true;
                    stream.trailers_block = Some(BytesMut::from(&headers.fragment[..]));
                    if !headers.end_headers {
                        stream.state = StreamState::Continuation;
                    }
                    Disposition::Trailers {
                        end_headers: headers.end_headers,
                    }
                }
                state if state.is_half_closed() => Disposition::HalfClosed,
                state if state.is_terminal() => Disposition::Terminal,
                _ => Disposition::Unexpected,
            }
        };
        match disposition {
            Disposition::Trailers { end_headers } => {
                if end_headers {
                    self.finish_header_block(id).await
                } else {
                    self.expect_continuation = Some(id);
                    Ok(())
                }
            }
            Disposition::MissingEndStream => Err(conn_error(
                Reason::PROTOCOL_ERROR,
                "trailer HEADERS without END_STREAM",
            )),
            Disposition::HalfClosed | Disposition::Terminal => Err(conn_error(
                Reason::STREAM_CLOSED,
                "HEADERS for a closed stream",
            )),
            Disposition::Unexpected => Err(conn_error(
                Reason::PROTOCOL_ERROR,
                "unexpected HEADERS frame",
            )),
        }
    }

    async fn on_continuation(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let cont = Continuation::parse(head, payload)?;
        let id = cont.stream_id;
        debug_assert_eq!(self.expect_continuation, Some(id));

        {
            let stream = self.streams.get_mut(&id).ok_or_else(|| {
                conn_error(Reason::PROTOCOL_ERROR, "CONTINUATION for unknown stream")
            })?;
            let block = match stream.trailers_block.as_mut() {
                Some(block) => block,
                None => &mut stream.header_block,
            };
            if block.len() + cont.fragment.len() > MAX_HEADER_BLOCK {
                return Err(conn_error(
                    Reason::ENHANCE_YOUR_CALM,
                    "header block too large",
                ));
            }
            block.extend_from_slice(&cont.fragment);
        }

        if cont.end_headers {
            self.finish_header_block(id).await
        } else {
            Ok(())
        }
    }

    fn on_priority(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let priority = Priority::parse(head, payload)?;
        // Priority may address idle or closed streams; only live ones care.
        if let Some(stream) = self.streams.get_mut(&priority.stream_id) {
            stream.weight = priority.weight;
        }
        Ok(())
    }

    fn on_reset(&mut self, head: Head, payload: Bytes) -> crate::Result<()> {
        let reset = Reset::parse(head, payload)?;
        match self.streams.get_mut(&reset.stream_id) {
            Some(stream) => {
                debug!(
                    "stream {} reset by peer: {:?}",
                    reset.stream_id, reset.error_code
                );
                stream.abort(StreamState::Reset);
                Ok(())
            }
            None if reset.stream_id > self.highest_stream_id => Err(conn_error(
                Reason::PROTOCOL_ERROR,
                "RST_STREAM on an idle stream",
            )),
            None => Ok(()),
        }
    }

    /// Decodes a finished header block and advances the stream.
    async fn finish_header_block(&mut self, id: u32) -> crate::Result<()> {
        self.expect_continuation = None;

        let (raw, is_trailers, end_stream) = {
            let stream = self.streams.get_mut(&id).expect("stream exists");
            match stream.trailers_block.take() {
                Some(block) => (block.freeze(), true, stream.end_stream),
                None => (stream.header_block.split().freeze(), false, stream.end_stream),
            }
        };

        // HPACK state is connection-wide, so decode failures kill the
        // whole session.
        let fields = self.hpack_dec.decode(raw)?;

        let list_size: usize = fields.iter().map(|(n, v)| n.len() + v.len() + 32).sum();
        if list_size > self.config.max_header_list_size as usize {
            return self
                .reset_stream(id, Reason::PROTOCOL_ERROR, "header list exceeds limit")
                .await;
        }

        if is_trailers {
            match streams::trailers_from_fields(fields) {
                Ok(trailers) => {
                    self.streams.get_mut(&id).expect("stream exists").trailers =
                        Some(trailers);
                }
                Err(err) => {
                    let reason = err.h2_reason().unwrap_or(Reason::PROTOCOL_ERROR);
                    return self.reset_stream(id, reason, "malformed trailers").await;
                }
            }
        } else {
            match streams::request_head_from_fields(fields) {
                Ok(parts) => {
                    let stream = self.streams.get_mut(&id).expect("stream exists");
                    stream.head = Some(parts);
                    if !end_stream {
                        stream.state = StreamState::Payload;
                    }
                }
                Err(err) => {
                    let reason = err.h2_reason().unwrap_or(Reason::PROTOCOL_ERROR);
                    return self.reset_stream(id, reason, "malformed request head").await;
                }
            }
        }

        if end_stream {
            self.dispatch(id).await?;
        }
        Ok(())
    }

    /// Hands a complete request to a handler task.
    async fn dispatch(&mut self, id: u32) -> crate::Result<()> {
        let refused = self.streams.get(&id).map(|s| s.refused).unwrap_or(true);
        if refused {
            return self
                .reset_stream(id, Reason::REFUSED_STREAM, "stream refused")
                .await;
        }

        let ctx = {
            let stream = self.streams.get_mut(&id).expect("stream exists");
            stream.state = StreamState::Ready;
            let parts = stream.head.take().expect("dispatch without request head");
            let uri = match parts.uri() {
                Ok(uri) => uri,
                Err(_) => {
                    drop(parts);
                    return self
                        .reset_stream(id, Reason::PROTOCOL_ERROR, "invalid request URI")
                        .await;
                }
            };

            let mut req = Request::new(Body::full(stream.body.split().freeze()));
            *req.method_mut() = parts.method;
            *req.uri_mut() = uri;
            *req.version_mut() = http::Version::HTTP_2;
            *req.headers_mut() = parts.headers;
            if let Some(trailers) = stream.trailers.take() {
                req.extensions_mut().insert(Trailers(trailers));
            }

            // The request side of the stream record is handed off here,
            // exactly once; the session only touches windows and cancel
            // state from now on.
            stream.state = StreamState::Piped;
            TaskContext {
                writer: self.writer.clone(),
                service: self.service.clone(),
                id,
                request: Some(req),
                stream_window: stream.send_window.clone(),
                conn_window: self.conn_send_window.clone(),
                weight: stream.weight as u32,
                limits: self.limits.clone(),
                cancel: stream.cancel_rx.clone(),
                aborted: self.aborted.clone(),
                active: self.active.clone(),
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        self.exec.execute(respond(ctx));
        Ok(())
    }

    fn abort_streams(&mut self) {
        for stream in self.streams.values_mut() {
            if !stream.state.is_terminal() {
                trace!("aborting stream {}", stream.id);
                stream.abort(StreamState::Aborted);
            }
        }
    }
}

struct TaskContext {
    writer: SharedWriter,
    service: Arc<HttpService>,
    id: u32,
    request: Option<Request>,
    stream_window: Arc<SendWindow>,
    conn_window: Arc<SendWindow>,
    weight: u32,
    limits: Arc<PeerLimits>,
    cancel: watch::Receiver<bool>,
    aborted: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
}

/// Waits until the watched flag turns true; parks forever if the sender
/// vanished without signalling.
async fn flagged(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One stream's handler task: run the service, then stream the response
/// out under flow control.
async fn respond(mut ctx: TaskContext) {
    let req = ctx.request.take().expect("request present");
    let mut cancel = ctx.cancel.clone();
    let mut aborted = ctx.aborted.clone();

    let res = tokio::select! {
        res = ctx.service.handle(req) => res,
        _ = flagged(&mut cancel) => {
            trace!("stream {} cancelled before the handler finished", ctx.id);
            ctx.active.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        _ = flagged(&mut aborted) => {
            ctx.active.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };

    if let Err(err) = send_response(&mut ctx, res).await {
        if !err.is_broken_pipe() {
            warn!("stream {} response failed: {}", ctx.id, err);
        }
    }
    ctx.active.fetch_sub(1, Ordering::SeqCst);
}

fn response_can_have_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

async fn send_response(ctx: &mut TaskContext, mut res: Response) -> crate::Result<()> {
    let status = res.status();
    let mut body = std::mem::take(res.body_mut());
    let known_size = body.known_size();
    let can_have_body = response_can_have_body(status);

    let mut pending = BytesMut::new();
    let mut body_done = false;
    if can_have_body {
        // Opportunistically learn whether the body is already complete
        // so END_STREAM can ride the last frame actually needed.
        drain_ready_chunks(&mut body, &mut pending, &mut body_done)?;
    } else {
        body_done = true;
    }

    let end_on_headers = body_done && pending.is_empty();
    {
        let mut guard = ctx.writer.lock(ctx.weight).await;
        guard
            .send_response_headers(
                ctx.id,
                status,
                res.headers(),
                if can_have_body { known_size } else { None },
                end_on_headers,
                ctx.limits.max_frame_size.load(Ordering::SeqCst),
            )
            .await?;
    }
    if end_on_headers {
        return Ok(());
    }

    loop {
        if cancelled(ctx) {
            return Ok(());
        }

        if pending.is_empty() && !body_done {
            match body.data().await {
                Some(Ok(chunk)) => pending.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    let id = ctx.id;
                    let mut guard = ctx.writer.lock(PRIORITY_MAX).await;
                    let _ = guard
                        .send(|buf| Reset::new(id, Reason::INTERNAL_ERROR).encode(buf))
                        .await;
                    return Err(err);
                }
                None => body_done = true,
            }
            drain_ready_chunks(&mut body, &mut pending, &mut body_done)?;
        }

        if pending.is_empty() && body_done {
            // The last DATA frame already went out without END_STREAM.
            let id = ctx.id;
            let mut guard = ctx.writer.lock(ctx.weight).await;
            guard
                .send(|buf| Data::new(id, Bytes::new(), true).encode(buf))
                .await?;
            return Ok(());
        }

        // One DATA frame moves at most min(stream window, connection
        // window, peer max frame size) bytes.
        let max_frame = ctx.limits.max_frame_size.load(Ordering::SeqCst) as usize;
        let want = std::cmp::min(pending.len(), max_frame);
        let granted = match reserve_window(ctx, want).await {
            Some(granted) => granted,
            None => return Ok(()), // cancelled while parked
        };

        let chunk = pending.split_to(granted).freeze();
        if pending.is_empty() && !body_done {
            drain_ready_chunks(&mut body, &mut pending, &mut body_done)?;
        }
        let end_stream = body_done && pending.is_empty();

        let id = ctx.id;
        let mut guard = ctx.writer.lock(ctx.weight).await;
        guard
            .send(|buf| Data::new(id, chunk, end_stream).encode(buf))
            .await?;
        drop(guard);

        if end_stream {
            return Ok(());
        }
    }
}

/// Pulls whatever body chunks are synchronously ready.
fn drain_ready_chunks(
    body: &mut Body,
    pending: &mut BytesMut,
    done: &mut bool,
) -> crate::Result<()> {
    while !*done {
        match body.data().now_or_never() {
            Some(Some(Ok(chunk))) => pending.extend_from_slice(&chunk),
            Some(Some(Err(err))) => return Err(err),
            Some(None) => *done = true,
            None => break,
        }
    }
    Ok(())
}

fn cancelled(ctx: &TaskContext) -> bool {
    *ctx.cancel.borrow() || *ctx.aborted.borrow()
}

/// Takes up to `want` bytes from the stream and connection windows,
/// parking until WINDOW_UPDATE opens one of them; `None` on cancel.
async fn reserve_window(ctx: &mut TaskContext, want: usize) -> Option<usize> {
    loop {
        if cancelled(ctx) {
            return None;
        }

        let stream_notified = ctx.stream_window.notified();
        let conn_notified = ctx.conn_window.notified();
        tokio::pin!(stream_notified, conn_notified);
        // Register before checking the windows so an increment between
        // the check and the park is not lost.
        stream_notified.as_mut().enable();
        conn_notified.as_mut().enable();

        let from_stream = ctx.stream_window.take(want);
        if from_stream > 0 {
            let granted = ctx.conn_window.take(from_stream);
            if granted > 0 {
                if granted < from_stream {
                    ctx.stream_window.put_back(from_stream - granted);
                }
                return Some(granted);
            }
            // Connection window is dry; return the stream grant and park.
            ctx.stream_window.put_back(from_stream);
            let mut cancel = ctx.cancel.clone();
            let mut aborted = ctx.aborted.clone();
            tokio::select! {
                _ = conn_notified => (),
                _ = flagged(&mut cancel) => return None,
                _ = flagged(&mut aborted) => return None,
            }
            continue;
        }

        let mut cancel = ctx.cancel.clone();
        let mut aborted = ctx.aborted.clone();
        tokio::select! {
            _ = stream_notified => (),
            _ = flagged(&mut cancel) => return None,
            _ = flagged(&mut aborted) => return None,
        }
    }
}
