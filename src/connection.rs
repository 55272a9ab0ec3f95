// ABOUTME: The live Connection type: reader/writer/tester tasks sharing protocol state
// ABOUTME: behind one async mutex, plus the ack-advance algorithm and the three timers

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::apdu::{self, seq_distance, seq_next, Apdu, UFunction};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;

enum SendItem {
    Payload(Bytes),
    Drain(oneshot::Sender<()>),
}

struct Inner {
    writer: BufWriter<OwnedWriteHalf>,
    ssn: u16,
    rsn: u16,
    ack: u16,
    w: u16,
    is_enabled: bool,
    always_enabled: bool,
    waiting_ack: HashMap<u16, JoinHandle<()>>,
    supervisory_timer: Option<JoinHandle<()>>,
}

impl Inner {
    async fn write_apdu(&mut self, apdu: &Apdu) -> Result<(), ConnectionError> {
        let bytes = apdu::encode(apdu);
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn cancel_supervisory_timer(&mut self) {
        if let Some(handle) = self.supervisory_timer.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
struct Shared {
    inner: Arc<Mutex<Inner>>,
    window_notify: Arc<Notify>,
    test_event: Arc<Notify>,
    closed_tx: watch::Sender<bool>,
    config: ConnectionConfig,
}

impl Shared {
    fn trigger_close(&self) {
        let _ = self.closed_tx.send(true);
        self.window_notify.notify_waiters();
        self.test_event.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

/// A cheaply cloneable handle that can close a `Connection` without owning
/// it. Used by `Listener::close()` to tear down every connection it has
/// produced.
#[derive(Clone)]
pub struct CloseHandle {
    closed_tx: watch::Sender<bool>,
}

impl CloseHandle {
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

/// A live APCI connection, born from either [`crate::connect`] or
/// [`crate::Listener::accept`].
///
/// Internally this owns three cooperating tasks (reader, writer, tester)
/// that share one piece of protocol state and one TCP write half behind a
/// single async mutex, so that no two tasks ever interleave partial frame
/// writes or race on sequence-number bookkeeping.
pub struct Connection {
    shared: Shared,
    send_tx: mpsc::UnboundedSender<SendItem>,
    recv_rx: mpsc::UnboundedReceiver<Bytes>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    tester_task: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn new(socket: TcpStream, always_enabled: bool, config: ConnectionConfig) -> Connection {
        let _ = socket.set_nodelay(true);
        let (read_half, write_half) = socket.into_split();

        let inner = Inner {
            writer: BufWriter::new(write_half),
            ssn: 0,
            rsn: 0,
            ack: 0,
            w: 0,
            is_enabled: always_enabled,
            always_enabled,
            waiting_ack: HashMap::new(),
            supervisory_timer: None,
        };

        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Shared {
            inner: Arc::new(Mutex::new(inner)),
            window_notify: Arc::new(Notify::new()),
            test_event: Arc::new(Notify::new()),
            closed_tx,
            config,
        };

        info!(always_enabled, "connection established");

        // `recv_tx` is owned solely by the reader task (not cloned into
        // `Shared`, which every task and the `Connection` itself hold): when
        // the reader loop exits for any reason, dropping its only sender
        // closes the inbound channel, so a `receive()` call draining an empty
        // queue observes `Closed` instead of blocking forever.
        let reader_task = tokio::spawn(reader_loop(shared.clone(), read_half, closed_rx.clone(), recv_tx));
        let writer_task = tokio::spawn(writer_loop(shared.clone(), send_rx, closed_rx.clone()));
        let tester_task = tokio::spawn(tester_loop(shared.clone(), closed_rx));

        Connection {
            shared,
            send_tx,
            recv_rx,
            reader_task,
            writer_task,
            tester_task,
        }
    }

    /// Enqueues a payload for transmission. Returns as soon as it is queued;
    /// the actual write happens on the writer task, subject to window
    /// capacity and the enabled/disabled state.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), ConnectionError> {
        if self.shared.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.send_tx
            .send(SendItem::Payload(payload.into()))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Resolves once every `send` queued before this call has been handed to
    /// the OS socket.
    pub async fn drain(&self) -> Result<(), ConnectionError> {
        if self.shared.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.send_tx
            .send(SendItem::Drain(tx))
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)
    }

    /// Yields the next ASDU payload extracted from an inbound I-frame, in
    /// arrival order.
    pub async fn receive(&mut self) -> Result<Bytes, ConnectionError> {
        self.recv_rx.recv().await.ok_or(ConnectionError::Closed)
    }

    /// Initiates a graceful shutdown: stops the reader/writer/tester tasks,
    /// fails any outstanding `drain()` with a connection-closed error, and
    /// releases the socket.
    pub fn close(&self) {
        self.shared.trigger_close();
    }

    /// Non-blocking status check.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// A cheaply cloneable handle that can close this connection from
    /// outside the task that owns it.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closed_tx: self.shared.closed_tx.clone(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Signal close and let the reader/writer/tester tasks observe it and
        // run their own shutdown/cleanup before exiting on their own; aborting
        // them here instead could cut a task off mid-cleanup (e.g. before the
        // writer has cancelled every outstanding response timer).
        self.shared.trigger_close();
    }
}

/// Reads one complete APDU from `reader`, growing `buffer` as needed. A
/// clean EOF (nothing buffered, nothing more to read) returns `Ok(None)`; an
/// EOF mid-frame is an error.
pub(crate) async fn read_one_apdu<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<Apdu>, ConnectionError> {
    loop {
        let needed = apdu::next_apdu_size(&buffer[..])?;
        if buffer.len() >= needed {
            let frame = buffer.split_to(needed);
            return Ok(Some(apdu::decode(&frame)?));
        }
        if reader.read_buf(buffer).await? == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(ConnectionError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection reset mid-frame",
                )))
            };
        }
    }
}

async fn reader_loop(
    shared: Shared,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    mut closed_rx: watch::Receiver<bool>,
    recv_tx: mpsc::UnboundedSender<Bytes>,
) {
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    loop {
        tokio::select! {
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    break;
                }
            }
            result = read_one_apdu(&mut read_half, &mut buffer) => {
                match result {
                    Ok(Some(apdu)) => {
                        if let Err(err) = handle_apdu(&shared, apdu, &recv_tx).await {
                            warn!(error = %err, "protocol violation, closing connection");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("peer closed connection");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "frame decode error, closing connection");
                        break;
                    }
                }
            }
        }
    }
    // Dropping `recv_tx` here (its only owner) closes the inbound channel so
    // a `receive()` draining the queue observes `Closed` rather than
    // blocking forever.
    drop(recv_tx);
    shared.trigger_close();
}

async fn handle_apdu(shared: &Shared, apdu: Apdu, recv_tx: &mpsc::UnboundedSender<Bytes>) -> Result<(), ConnectionError> {
    match apdu {
        Apdu::U(function) => handle_u_frame(shared, function).await,
        Apdu::S { recv_seq } => ack_advance(shared, recv_seq).await,
        Apdu::I {
            send_seq,
            recv_seq,
            payload,
        } => {
            ack_advance(shared, recv_seq).await?;

            let mut inner = shared.inner.lock().await;
            if send_seq != inner.rsn {
                return Err(ConnectionError::SequenceGap {
                    expected: inner.rsn,
                    actual: send_seq,
                });
            }
            inner.rsn = seq_next(inner.rsn);
            let rsn = inner.rsn;
            if inner.supervisory_timer.is_none() {
                inner.supervisory_timer = Some(spawn_supervisory_timer(shared.clone()));
            }
            inner.w += 1;
            let should_ack = inner.w >= shared.config.receive_window_size;
            if should_ack {
                inner.cancel_supervisory_timer();
                inner.write_apdu(&Apdu::S { recv_seq: rsn }).await?;
                inner.w = 0;
            }
            drop(inner);

            if !payload.is_empty() {
                let _ = recv_tx.send(payload);
            }
            Ok(())
        }
    }
}

async fn handle_u_frame(shared: &Shared, function: UFunction) -> Result<(), ConnectionError> {
    match function {
        UFunction::StartDtAct => {
            let mut inner = shared.inner.lock().await;
            inner.is_enabled = true;
            inner.write_apdu(&Apdu::U(UFunction::StartDtCon)).await
        }
        UFunction::StopDtAct => {
            let mut inner = shared.inner.lock().await;
            if !inner.always_enabled {
                let rsn = inner.rsn;
                inner.write_apdu(&Apdu::S { recv_seq: rsn }).await?;
                inner.w = 0;
                inner.cancel_supervisory_timer();
                inner.is_enabled = false;
                inner.write_apdu(&Apdu::U(UFunction::StopDtCon)).await?;
            }
            Ok(())
        }
        UFunction::StartDtCon | UFunction::StopDtCon => Ok(()),
        UFunction::TestFrAct => {
            let mut inner = shared.inner.lock().await;
            inner.write_apdu(&Apdu::U(UFunction::TestFrCon)).await
        }
        UFunction::TestFrCon => {
            shared.test_event.notify_waiters();
            Ok(())
        }
    }
}

/// Walks every sequence number in `[ack, recv_seq)` (with wraparound),
/// cancelling each one's response timer. Re-acknowledging the same
/// `recv_seq` is a no-op, so this is idempotent against duplicates.
async fn ack_advance(shared: &Shared, recv_seq: u16) -> Result<(), ConnectionError> {
    let mut inner = shared.inner.lock().await;
    let start = inner.ack;
    if start != recv_seq {
        let distance = seq_distance(start, recv_seq);
        let mut n = start;
        for _ in 0..distance {
            match inner.waiting_ack.remove(&n) {
                Some(handle) => handle.abort(),
                None => return Err(ConnectionError::AckForUnsent { ssn: n }),
            }
            n = seq_next(n);
        }
        inner.ack = recv_seq;
    }
    drop(inner);
    shared.window_notify.notify_waiters();
    Ok(())
}

fn spawn_response_timer(shared: Shared, ssn: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(shared.config.response_timeout).await;
        warn!(ssn, "response timeout, closing connection");
        shared.trigger_close();
    })
}

fn spawn_supervisory_timer(shared: Shared) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(shared.config.supervisory_timeout).await;
        let mut inner = shared.inner.lock().await;
        inner.supervisory_timer = None;
        let rsn = inner.rsn;
        if let Err(err) = inner.write_apdu(&Apdu::S { recv_seq: rsn }).await {
            warn!(error = %err, "supervisory timeout: failed to emit S-frame");
        }
        inner.w = 0;
    })
}

async fn wait_for_window_capacity(
    shared: &Shared,
    closed_rx: &mut watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    loop {
        let notified = shared.window_notify.notified();
        tokio::pin!(notified);
        // Register as a waiter before checking the capacity condition, not
        // merely after creating the future: `notify_waiters()` only wakes
        // waiters already registered at the time it's called, and without an
        // explicit `enable()` that registration doesn't happen until this
        // future is first polled. An ack freeing the last slot between the
        // unlock below and the `select!` below would otherwise be missed.
        notified.as_mut().enable();
        {
            if shared.is_closed() {
                return Err(ConnectionError::Closed);
            }
            let inner = shared.inner.lock().await;
            if (inner.waiting_ack.len() as u16) < shared.config.send_window_size {
                return Ok(());
            }
        }
        tokio::select! {
            _ = &mut notified => {}
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    return Err(ConnectionError::Closed);
                }
            }
        }
    }
}

async fn writer_loop(
    shared: Shared,
    mut send_rx: mpsc::UnboundedReceiver<SendItem>,
    mut closed_rx: watch::Receiver<bool>,
) {
    'outer: loop {
        let item = tokio::select! {
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    break 'outer;
                }
                continue;
            }
            item = send_rx.recv() => match item {
                Some(item) => item,
                None => break 'outer,
            }
        };

        match item {
            SendItem::Drain(done) => {
                let _ = done.send(());
            }
            SendItem::Payload(payload) => {
                if wait_for_window_capacity(&shared, &mut closed_rx).await.is_err() {
                    break 'outer;
                }

                let mut inner = shared.inner.lock().await;
                if !inner.is_enabled {
                    debug!("data transfer disabled, discarding queued payload");
                    continue;
                }
                let ssn = inner.ssn;
                let rsn = inner.rsn;
                // Unreachable while `config.validate()` keeps
                // `send_window_size` under the sequence-number modulus (it
                // guarantees fewer outstanding ssns than the space has
                // values to reuse), but guard against it rather than
                // silently overwriting and leaking the old timer handle.
                if inner.waiting_ack.contains_key(&ssn) {
                    warn!(ssn, "window invariant violated: ssn already awaiting ack");
                    drop(inner);
                    shared.trigger_close();
                    break 'outer;
                }
                if let Err(err) = inner
                    .write_apdu(&Apdu::I {
                        send_seq: ssn,
                        recv_seq: rsn,
                        payload,
                    })
                    .await
                {
                    warn!(error = %err, "write failed, closing connection");
                    drop(inner);
                    shared.trigger_close();
                    break 'outer;
                }
                inner.w = 0;
                inner.cancel_supervisory_timer();
                let handle = spawn_response_timer(shared.clone(), ssn);
                inner.waiting_ack.insert(ssn, handle);
                inner.ssn = seq_next(ssn);
            }
        }
    }

    let mut inner = shared.inner.lock().await;
    for (_, handle) in inner.waiting_ack.drain() {
        handle.abort();
    }
    inner.cancel_supervisory_timer();
    drop(inner);

    while let Ok(item) = send_rx.try_recv() {
        if let SendItem::Drain(done) = item {
            drop(done);
        }
    }

    shared.trigger_close();
}

async fn tester_loop(shared: Shared, mut closed_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(shared.config.test_timeout) => {}
        }

        if shared.is_closed() {
            break;
        }

        let notified = shared.test_event.notified();
        tokio::pin!(notified);

        {
            let mut inner = shared.inner.lock().await;
            if let Err(err) = inner.write_apdu(&Apdu::U(UFunction::TestFrAct)).await {
                warn!(error = %err, "failed to send test frame");
                drop(inner);
                shared.trigger_close();
                break;
            }
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(shared.config.response_timeout) => {
                warn!("test-frame timeout, closing connection");
                shared.trigger_close();
                break;
            }
            changed = closed_rx.changed() => {
                if changed.is_err() || *closed_rx.borrow() {
                    break;
                }
            }
        }
    }
}
