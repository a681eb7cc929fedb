use std::sync::{Arc, Mutex, MutexGuard};

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::{backend, frontend};
use tokio::sync::mpsc::UnboundedReceiver;
use xitca_io::bytes::BytesMut;

use super::{
    discover,
    driver::{
        codec::{Notification, Response},
        generic::{DriverTx, SharedState},
        TransactionStatus,
    },
    error::{DriverDownReceiving, EmptyQuery, Error},
    params::{self, PackedParams, Params},
    result::{command_tag, parse_columns, Description, ResultStatus, Results},
    session::Session,
    types::{Oid, OidMap, OidPair, PgType, Udt},
};

/// handle to one database connection, multiplexing requests onto the
/// connection's [Driver] task.
///
/// query producing operations are cooperative single task: issue one at a
/// time and await it. [Client::receive_notification] is the exception and
/// may run concurrently with an in flight query on the same connection.
///
/// [Driver]: crate::Driver
pub struct Client {
    tx: DriverTx,
    shared: Arc<SharedState>,
    session: Session,
    // shared encoding buffer, cleared at the start of each pack
    buf: Mutex<BytesMut>,
    oids: Mutex<OidMap>,
    notify: tokio::sync::Mutex<UnboundedReceiver<Notification>>,
}

impl Client {
    pub(crate) fn new(
        tx: DriverTx,
        shared: Arc<SharedState>,
        notify: UnboundedReceiver<Notification>,
        session: Session,
    ) -> Self {
        Self {
            tx,
            shared,
            session,
            buf: Mutex::new(BytesMut::new()),
            oids: Mutex::new(OidMap::new()),
            notify: tokio::sync::Mutex::new(notify),
        }
    }

    /// execute one statement with typed parameters, in binary format, and
    /// collect its complete response.
    ///
    /// parameters populate `$1..$N` placeholders in order. a single
    /// parameter is written as a one element tuple.
    ///
    /// user defined composite types reachable from the parameter shapes are
    /// discovered on the server before the statement is sent.
    ///
    /// # Examples
    /// ```rust
    /// # use pgpipe::{Client, error::Error};
    /// # async fn example(client: &Client) -> Result<(), Error> {
    /// let res = client.query("SELECT $1::INT4 + $2::INT4", (1, 2)).await?;
    /// let sum = res.get(0)?.try_get::<i32>(0)?;
    /// assert_eq!(sum, 3);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query<P>(&self, sql: &str, params: P) -> Result<Results, Error>
    where
        P: Params,
    {
        discover::resolve_params::<P>(self).await?;
        let res = self.send_query(sql, &params)?;
        collect_single(res).await
    }

    /// name a server side prepared statement for later execution with
    /// [Client::query_prepared].
    pub async fn prepare(&self, name: &str, sql: &str) -> Result<(), Error> {
        let msg = {
            let mut buf = self.buf.lock().unwrap();
            buf.clear();
            frontend::parse(name, sql, core::iter::empty::<Oid>(), &mut buf)?;
            frontend::sync(&mut buf);
            buf.split()
        };
        let mut res = self.tx.send(msg, 1)?;
        loop {
            match res.recv().await? {
                backend::Message::ParseComplete => {}
                backend::Message::ReadyForQuery(_) => return Ok(()),
                _ => return Err(Error::unexpected()),
            }
        }
    }

    /// execute a statement previously named with [Client::prepare].
    pub async fn query_prepared<P>(&self, name: &str, params: P) -> Result<Results, Error>
    where
        P: Params,
    {
        discover::resolve_params::<P>(self).await?;
        let msg = {
            let oids = self.oids.lock().unwrap();
            let packed = PackedParams::new(&oids, &params)?;
            let mut buf = self.buf.lock().unwrap();
            buf.clear();
            params::encode_query_prepared(&mut buf, name, &packed)?;
            frontend::sync(&mut buf);
            buf.split()
        };
        collect_single(self.tx.send(msg, 1)?).await
    }

    /// fetch parameter and column metadata of a prepared statement.
    pub async fn describe_prepared(&self, name: &str) -> Result<Description, Error> {
        self.describe(b'S', name).await
    }

    /// fetch column metadata of an open portal.
    pub async fn describe_portal(&self, name: &str) -> Result<Description, Error> {
        self.describe(b'P', name).await
    }

    async fn describe(&self, variant: u8, name: &str) -> Result<Description, Error> {
        let msg = {
            let mut buf = self.buf.lock().unwrap();
            buf.clear();
            frontend::describe(variant, name, &mut buf)?;
            frontend::sync(&mut buf);
            buf.split()
        };
        let mut res = self.tx.send(msg, 1)?;

        let mut params = Vec::new();
        let mut columns = Vec::new();

        loop {
            match res.recv().await? {
                backend::Message::ParameterDescription(body) => {
                    let mut iter = body.parameters();
                    while let Some(oid) = iter.next()? {
                        params.push(oid);
                    }
                }
                backend::Message::RowDescription(body) => columns = parse_columns(&body)?,
                backend::Message::NoData => {}
                backend::Message::ReadyForQuery(_) => return Ok(Description::new(params, columns)),
                _ => return Err(Error::unexpected()),
            }
        }
    }

    /// wait for the next asynchronous notification on this connection.
    ///
    /// notifications arrive through `LISTEN`/`NOTIFY` and may be delivered
    /// between any two results. this operation composes with a concurrent
    /// query on the same connection; notifications observed while no task
    /// waits here are buffered in arrival order.
    pub async fn receive_notification(&self) -> Result<Notification, Error> {
        let mut rx = self.notify.lock().await;
        rx.recv().await.ok_or_else(|| DriverDownReceiving.into())
    }

    /// resolve the oids of a user defined composite type (and every user
    /// defined type reachable from it) against the server.
    ///
    /// the async query paths do this on demand; staging queries into a
    /// [Pipeline] requires the types to be resolved up front.
    ///
    /// [Pipeline]: crate::pipeline::Pipeline
    pub async fn discover<T>(&self) -> Result<(), Error>
    where
        T: PgType,
    {
        discover::resolve_type::<T>(self).await
    }

    /// transaction state of the connection as reported by the server after
    /// the latest completed request.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.shared.transaction_status()
    }

    /// a lossy hint whether the connection's io driver has shut down.
    pub fn closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// backend identity captured during the handshake.
    pub fn session(&self) -> Session {
        self.session
    }

    /// read access to the connection's registry of discovered user defined
    /// types.
    pub fn types(&self) -> MutexGuard<'_, OidMap> {
        self.oids.lock().unwrap()
    }

    pub(crate) fn send_query<P>(&self, sql: &str, params: &P) -> Result<Response, Error>
    where
        P: Params,
    {
        let msg = {
            let oids = self.oids.lock().unwrap();
            let packed = PackedParams::new(&oids, params)?;
            let mut buf = self.buf.lock().unwrap();
            buf.clear();
            params::encode_query(&mut buf, sql, &packed)?;
            frontend::sync(&mut buf);
            buf.split()
        };
        self.tx.send(msg, 1)
    }

    pub(crate) fn send_raw(&self, msg: BytesMut, sync_count: usize) -> Result<Response, Error> {
        self.tx.send(msg, sync_count)
    }

    // hand out the shared encoding buffer for staging, cleared.
    pub(crate) fn take_buf(&self) -> BytesMut {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        core::mem::take(&mut *buf)
    }

    pub(crate) fn put_buf(&self, mut buf: BytesMut) {
        buf.clear();
        *self.buf.lock().unwrap() = buf;
    }

    pub(crate) fn type_map(&self) -> MutexGuard<'_, OidMap> {
        self.oids.lock().unwrap()
    }

    pub(crate) fn register_udt(&self, udt: &Udt, oids: OidPair) {
        self.oids.lock().unwrap().insert(udt.id, udt.name, oids);
    }
}

// drain one statement's response into a materialized result.
pub(crate) async fn collect_single(mut res: Response) -> Result<Results, Error> {
    let mut status = ResultStatus::CommandOk;
    let mut tag = None;
    let mut columns = Vec::new();
    let mut rows = Vec::new();

    loop {
        match res.recv().await? {
            backend::Message::ParseComplete
            | backend::Message::BindComplete
            | backend::Message::ParameterDescription(_)
            | backend::Message::NoData
            | backend::Message::PortalSuspended => {}
            backend::Message::RowDescription(body) => {
                status = ResultStatus::TuplesOk;
                columns = parse_columns(&body)?;
            }
            backend::Message::DataRow(body) => rows.push(body),
            backend::Message::CommandComplete(body) => tag = Some(command_tag(&body)?),
            backend::Message::EmptyQueryResponse => return Err(EmptyQuery.into()),
            backend::Message::ReadyForQuery(_) => return Ok(Results::new(status, tag, columns, rows)),
            _ => return Err(Error::unexpected()),
        }
    }
}
