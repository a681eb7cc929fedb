//! framing between the client handle and the io driver.
//!
//! the driver splits the raw socket stream into frames: a normal frame is a
//! run of backend messages belonging to the request at the head of the
//! completion fifo, cut at ReadyForQuery boundaries; asynchronous messages
//! (notification, notice, parameter status) are extracted separately and
//! never consume a fifo entry.

use core::task::{ready, Context, Poll};

use std::io;

use postgres_protocol::message::backend;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use xitca_io::bytes::BytesMut;

use crate::error::{DriverDownReceiving, Error};

/// one framed request traveling to the io driver together with the sender
/// its response frames are delivered through.
pub(crate) struct Request {
    pub(crate) tx: ResponseSender,
    pub(crate) msg: BytesMut,
}

// a request expecting `sync_count` ReadyForQuery terminated frames and the
// receiving half handed to the caller.
pub(crate) fn request_pair(msg: BytesMut, sync_count: usize) -> (Request, Response) {
    let (tx, rx) = unbounded_channel();
    (
        Request {
            tx: ResponseSender {
                tx,
                remaining: sync_count,
            },
            msg,
        },
        Response {
            rx,
            buf: BytesMut::new(),
        },
    )
}

/// response frames of one in flight request, delivered in submission order
/// by the driver.
#[derive(Debug)]
pub(crate) struct Response {
    rx: UnboundedReceiver<BytesMut>,
    buf: BytesMut,
}

impl Response {
    // next backend message, turning server error responses into [DbError].
    //
    // [DbError]: crate::error::DbError
    pub(crate) async fn recv(&mut self) -> Result<backend::Message, Error> {
        match self.recv_raw().await? {
            backend::Message::ErrorResponse(body) => Err(Error::db(body.fields())),
            msg => Ok(msg),
        }
    }

    // next backend message with server error responses passed through as
    // plain messages. used by the pipeline collector which maps statement
    // failures onto individual staged queries.
    pub(crate) async fn recv_raw(&mut self) -> Result<backend::Message, Error> {
        core::future::poll_fn(|cx| self.poll_recv_raw(cx)).await
    }

    fn poll_recv_raw(&mut self, cx: &mut Context<'_>) -> Poll<Result<backend::Message, Error>> {
        if self.buf.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(frame) => self.buf = frame,
                // the driver dropped the sender: connection failed.
                None => return Poll::Ready(Err(DriverDownReceiving.into())),
            }
        }
        let msg = backend::Message::parse(&mut self.buf)?.expect("a delivered frame holds complete messages");
        Poll::Ready(Ok(msg))
    }
}

pub(crate) enum SenderState {
    Continue,
    Finish,
}

/// driver side sender of one completion fifo entry.
pub(crate) struct ResponseSender {
    tx: UnboundedSender<BytesMut>,
    // sync points of the request that have not completed yet
    remaining: usize,
}

impl ResponseSender {
    // forward one frame. `complete` marks a frame cut at ReadyForQuery.
    //
    // delivery to a dropped receiver is deliberately ignored: a cancelled
    // request switches its entry into drain mode where frames keep being
    // counted and discarded until the request's sync points are exhausted,
    // preserving fifo alignment for the requests behind it.
    pub(crate) fn send(&mut self, frame: BytesMut, complete: bool) -> SenderState {
        let _ = self.tx.send(frame);
        if complete {
            self.remaining -= 1;
            if self.remaining == 0 {
                return SenderState::Finish;
            }
        }
        SenderState::Continue
    }
}

pub(super) enum ResponseMessage {
    Normal { buf: BytesMut, complete: bool },
    Async(backend::Message),
}

impl ResponseMessage {
    // cut the next frame from the read buffer. returns None until a full
    // message is buffered.
    pub(super) fn try_from_buf(buf: &mut BytesMut) -> Result<Option<Self>, Error> {
        let mut offset = 0;
        let mut complete = false;

        while let Some(header) = backend::Header::parse(&buf[offset..])? {
            let len = header.len() as usize + 1;
            if buf[offset..].len() < len {
                break;
            }

            match header.tag() {
                backend::NOTICE_RESPONSE_TAG | backend::NOTIFICATION_RESPONSE_TAG | backend::PARAMETER_STATUS_TAG => {
                    // emit buffered normal messages first; the async message
                    // is picked up by the next call.
                    if offset > 0 {
                        break;
                    }
                    let msg = backend::Message::parse(buf)?.expect("a complete message is buffered");
                    return Ok(Some(ResponseMessage::Async(msg)));
                }
                tag => {
                    offset += len;
                    if tag == backend::READY_FOR_QUERY_TAG {
                        complete = true;
                        break;
                    }
                }
            }
        }

        if offset == 0 {
            return Ok(None);
        }
        Ok(Some(ResponseMessage::Normal {
            buf: buf.split_to(offset),
            complete,
        }))
    }
}

/// an asynchronous notification record produced by some session invoking
/// `NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub(crate) process_id: i32,
    pub(crate) channel: String,
    pub(crate) payload: String,
}

impl Notification {
    pub(crate) fn parse(body: &backend::NotificationResponseBody) -> io::Result<Self> {
        Ok(Self {
            process_id: body.process_id(),
            channel: body.channel()?.to_string(),
            payload: body.message()?.to_string(),
        })
    }

    /// process id of the backend session that sent the notification.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// the channel the notification was sent on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// the notification payload string.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

#[cfg(test)]
mod test {
    use xitca_io::bytes::BufMut;

    use super::*;

    fn put_msg(buf: &mut BytesMut, tag: u8, body: &[u8]) {
        buf.put_u8(tag);
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);
    }

    fn command_complete(buf: &mut BytesMut) {
        put_msg(buf, b'C', b"SELECT 1\0");
    }

    fn ready_for_query(buf: &mut BytesMut) {
        put_msg(buf, b'Z', b"I");
    }

    #[test]
    fn frame_cut_at_ready_for_query() {
        let mut buf = BytesMut::new();
        command_complete(&mut buf);
        ready_for_query(&mut buf);
        command_complete(&mut buf);

        match ResponseMessage::try_from_buf(&mut buf).unwrap().unwrap() {
            ResponseMessage::Normal { buf: frame, complete } => {
                assert!(complete);
                assert_eq!(frame.last(), Some(&b'I'));
            }
            _ => panic!("expected a normal frame"),
        }

        // the trailing command complete stays buffered as an unfinished frame
        match ResponseMessage::try_from_buf(&mut buf).unwrap().unwrap() {
            ResponseMessage::Normal { complete, .. } => assert!(!complete),
            _ => panic!("expected a normal frame"),
        }
    }

    #[test]
    fn partial_message_waits() {
        let mut buf = BytesMut::new();
        command_complete(&mut buf);
        let cut = buf.split_off(buf.len() - 3);
        assert!(ResponseMessage::try_from_buf(&mut buf).unwrap().is_none());
        buf.unsplit(cut);
        assert!(ResponseMessage::try_from_buf(&mut buf).unwrap().is_some());
    }

    #[test]
    fn async_message_extracted() {
        let mut buf = BytesMut::new();
        // NotificationResponse: pid, channel, payload
        let mut body = BytesMut::new();
        body.put_i32(7);
        body.put_slice(b"ch\0");
        body.put_slice(b"10\0");
        put_msg(&mut buf, b'A', &body);
        ready_for_query(&mut buf);

        match ResponseMessage::try_from_buf(&mut buf).unwrap().unwrap() {
            ResponseMessage::Async(backend::Message::NotificationResponse(body)) => {
                let n = Notification::parse(&body).unwrap();
                assert_eq!(n.process_id(), 7);
                assert_eq!(n.channel(), "ch");
                assert_eq!(n.payload(), "10");
            }
            _ => panic!("expected an async message"),
        }

        match ResponseMessage::try_from_buf(&mut buf).unwrap().unwrap() {
            ResponseMessage::Normal { complete, .. } => assert!(complete),
            _ => panic!("expected a normal frame"),
        }
    }

    #[test]
    fn async_message_after_normal_run_waits_its_turn() {
        let mut buf = BytesMut::new();
        command_complete(&mut buf);
        put_msg(&mut buf, b'A', &{
            let mut body = BytesMut::new();
            body.put_i32(1);
            body.put_slice(b"c\0\0");
            body
        });

        match ResponseMessage::try_from_buf(&mut buf).unwrap().unwrap() {
            ResponseMessage::Normal { complete, .. } => assert!(!complete),
            _ => panic!("expected a normal frame"),
        }
        match ResponseMessage::try_from_buf(&mut buf).unwrap().unwrap() {
            ResponseMessage::Async(_) => {}
            _ => panic!("expected an async message"),
        }
    }

    #[tokio::test]
    async fn sync_counting() {
        let mut frame1 = BytesMut::new();
        command_complete(&mut frame1);
        ready_for_query(&mut frame1);
        let mut frame2 = BytesMut::new();
        ready_for_query(&mut frame2);

        let (mut req, mut res) = request_pair(BytesMut::new(), 2);

        assert!(matches!(req.tx.send(frame1, true), SenderState::Continue));
        assert!(matches!(req.tx.send(frame2, true), SenderState::Finish));

        assert!(matches!(res.recv().await.unwrap(), backend::Message::CommandComplete(_)));
        assert!(matches!(res.recv().await.unwrap(), backend::Message::ReadyForQuery(_)));
        assert!(matches!(res.recv().await.unwrap(), backend::Message::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn dropped_driver_reports_connection_failure() {
        let (req, mut res) = request_pair(BytesMut::new(), 1);
        drop(req);
        let err = match res.recv().await {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.is_driver_down());
    }
}
