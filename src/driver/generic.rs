use core::{
    future::poll_fn,
    pin::Pin,
    sync::atomic::{AtomicU8, Ordering},
};

use std::{collections::VecDeque, io, sync::Arc};

use postgres_protocol::message::backend;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use xitca_io::{
    bytes::{BufInterest, BufRead, BufWrite, BytesMut, WriteBuf},
    io::{AsyncIo, Interest},
};
use xitca_unsafe_collection::futures::{Select as _, SelectOutput};

use crate::error::{DbError, DriverDown, Error};

use super::codec::{request_pair, Notification, Request, Response, ResponseMessage, ResponseSender, SenderState};

type PagedBytesMut = xitca_unsafe_collection::bytes::PagedBytesMut<4096>;

/// transaction state of the connection as reported by the latest
/// ReadyForQuery message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// not inside a transaction block.
    Idle,
    /// inside a transaction block.
    InTransaction,
    /// inside a failed transaction block.
    InError,
    /// nothing reported yet or an unknown status byte.
    Unknown,
}

// connection state shared between the client handle and the io driver.
pub(crate) struct SharedState {
    tx_status: AtomicU8,
}

impl SharedState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            tx_status: AtomicU8::new(b'I'),
        })
    }

    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        match self.tx_status.load(Ordering::Relaxed) {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::InError,
            _ => TransactionStatus::Unknown,
        }
    }

    fn set_transaction_status(&self, status: u8) {
        self.tx_status.store(status, Ordering::Relaxed);
    }
}

pub(crate) type DriverRx = UnboundedReceiver<Request>;

/// client side handle submitting framed requests to the io driver.
pub(crate) struct DriverTx(UnboundedSender<Request>);

impl DriverTx {
    /// lossy hint whether the io driver is still alive.
    pub(crate) fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// submit a framed request containing `sync_count` sync points and arm
    /// its completion fifo entry.
    pub(crate) fn send(&self, msg: BytesMut, sync_count: usize) -> Result<Response, Error> {
        let (req, res) = request_pair(msg, sync_count);
        self.0.send(req).map_err(|_| DriverDown)?;
        Ok(res)
    }
}

pub struct GenericDriver<Io> {
    io: Io,
    write_buf: WriteBuf,
    read_buf: PagedBytesMut,
    res: VecDeque<ResponseSender>,
    state: DriverState,
    shared: Arc<SharedState>,
    notify_tx: UnboundedSender<Notification>,
}

enum DriverState {
    Running(DriverRx),
    Closing(Option<io::Error>),
}

impl<Io> GenericDriver<Io>
where
    Io: AsyncIo + Send,
{
    pub(crate) fn new(io: Io, shared: Arc<SharedState>) -> (Self, DriverTx, UnboundedReceiver<Notification>) {
        let (tx, rx) = unbounded_channel();
        let (notify_tx, notify_rx) = unbounded_channel();
        (
            Self {
                io,
                write_buf: WriteBuf::new(),
                read_buf: PagedBytesMut::new(),
                res: VecDeque::new(),
                state: DriverState::Running(rx),
                shared,
                notify_tx,
            },
            DriverTx(tx),
            notify_rx,
        )
    }

    // direct send used during the handshake, before the request channel is
    // in use.
    pub(crate) async fn send(&mut self, msg: BytesMut) -> Result<(), Error> {
        self.write_buf_extend(&msg);
        loop {
            self.try_write()?;
            if self.write_buf.is_empty() {
                return Ok(());
            }
            self.io.ready(Interest::WRITABLE).await?;
        }
    }

    // direct receive used during the handshake.
    pub(crate) async fn recv(&mut self) -> Result<backend::Message, Error> {
        loop {
            if let Some(msg) = backend::Message::parse(self.read_buf.get_mut())? {
                return Ok(msg);
            }
            self.io.ready(Interest::READABLE).await?;
            self.try_read()?;
        }
    }

    /// drive the connection until the client gracefully goes away or an io
    /// failure tears it down.
    pub(crate) async fn run(&mut self) -> Result<(), Error> {
        let res = self.run_inner().await;
        if let Err(ref e) = res {
            tracing::error!("connection driver shut down: {e}");
            // wake every pending completion with the connection failure.
            self.res.clear();
        }
        res
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        loop {
            self.try_decode()?;

            let interest = if self.write_buf.want_write_io() {
                Interest::READABLE.add(Interest::WRITABLE)
            } else {
                Interest::READABLE
            };

            let select = match self.state {
                DriverState::Running(ref mut rx) => rx.recv().select(self.io.ready(interest)).await,
                DriverState::Closing(ref mut e) => {
                    if !interest.is_writable() && self.res.is_empty() {
                        // every request is answered and nothing is left to
                        // write. shut down io and exit.
                        poll_fn(|cx| Pin::new(&mut self.io).poll_shutdown(cx)).await?;
                        return match e.take() {
                            Some(e) => Err(e.into()),
                            None => Ok(()),
                        };
                    }
                    SelectOutput::B(self.io.ready(interest).await)
                }
            };

            match select {
                // batch the request bytes and arm its completion entry.
                SelectOutput::A(Some(req)) => {
                    self.write_buf_extend(&req.msg);
                    self.res.push_back(req.tx);
                }
                // client handles are gone. flush what is pending then close.
                SelectOutput::A(None) => self.state = DriverState::Closing(None),
                SelectOutput::B(ready) => {
                    let ready = ready?;
                    if ready.is_readable() {
                        self.try_read()?;
                    }
                    if ready.is_writable() {
                        self.try_write()?;
                    }
                }
            }
        }
    }

    fn write_buf_extend(&mut self, buf: &[u8]) {
        let _ = self.write_buf.write_buf(|w| {
            w.extend_from_slice(buf);
            Ok::<_, core::convert::Infallible>(())
        });
    }

    fn try_read(&mut self) -> Result<(), Error> {
        self.read_buf.do_io(&mut self.io).map_err(Into::into)
    }

    fn try_write(&mut self) -> Result<(), Error> {
        self.write_buf.do_io(&mut self.io).map_err(Into::into)
    }

    // split buffered input into frames and dispatch them to the head of the
    // completion fifo; asynchronous messages never consume a fifo entry.
    fn try_decode(&mut self) -> Result<(), Error> {
        while let Some(res) = ResponseMessage::try_from_buf(self.read_buf.get_mut())? {
            match res {
                ResponseMessage::Normal { buf, complete } => {
                    if complete {
                        if let Some(&status) = buf.last() {
                            self.shared.set_transaction_status(status);
                        }
                    }
                    let front = self.res.front_mut().ok_or_else(Error::unexpected)?;
                    if let SenderState::Finish = front.send(buf, complete) {
                        self.res.pop_front();
                    }
                }
                ResponseMessage::Async(msg) => self.handle_async(msg)?,
            }
        }
        Ok(())
    }

    fn handle_async(&mut self, msg: backend::Message) -> Result<(), Error> {
        match msg {
            backend::Message::NotificationResponse(body) => {
                let notification = Notification::parse(&body)?;
                // nobody waiting is fine; the channel buffers.
                let _ = self.notify_tx.send(notification);
            }
            backend::Message::NoticeResponse(body) => match DbError::parse(&mut body.fields()) {
                Ok(notice) => tracing::info!("notice from server: {notice}"),
                Err(_) => tracing::info!("unreadable notice from server"),
            },
            backend::Message::ParameterStatus(_) => {}
            _ => return Err(Error::unexpected()),
        }
        Ok(())
    }
}
