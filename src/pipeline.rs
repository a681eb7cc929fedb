//! explicit query pipelining.
//!
//! a pipeline stages multiple extended queries into the connection's
//! encoding buffer and flushes them atomically under a single sync
//! barrier. the server executes them in staging order and the whole batch
//! costs one socket round trip.

use postgres_protocol::message::{backend, frontend};
use xitca_io::bytes::BytesMut;

use super::{
    client::Client,
    driver::codec::Response,
    error::{EmptyQuery, Error, PipelineAborted, PipelineOperationFailed},
    params::{self, PackedParams, Params},
    result::{command_tag, parse_columns, ResultStatus, Results},
    types::OidMap,
};

/// outcome of one staged statement. a failed statement carries its server
/// error; statements staged after a failure carry [PipelineAborted] since
/// the server skips them up to the sync barrier.
pub type PipelineResult = Result<Results, Error>;

/// staging builder handed to the closure of [Client::pipeline].
///
/// each push serializes the query immediately into the staging buffer and
/// returns its index among the staged queries. once the batch is flushed
/// the builder is gone; its indexes address the returned result vector.
pub struct Pipeline<'a> {
    cli: &'a Client,
    buf: BytesMut,
    queued: usize,
}

impl Pipeline<'_> {
    /// stage one extended query with typed parameters.
    ///
    /// user defined composite types referenced by the parameters must
    /// already be resolved (by an earlier query or [Client::discover]):
    /// staging is synchronous and can not run the discovery round trip.
    pub fn push_query<P>(&mut self, sql: &str, params: P) -> Result<usize, Error>
    where
        P: Params,
    {
        self.push_with(|map, buf| {
            let packed = PackedParams::new(map, &params)?;
            params::encode_query(buf, sql, &packed)
        })
    }

    /// stage one execution of a statement previously named with
    /// [Client::prepare].
    pub fn push_query_prepared<P>(&mut self, name: &str, params: P) -> Result<usize, Error>
    where
        P: Params,
    {
        self.push_with(|map, buf| {
            let packed = PackedParams::new(map, &params)?;
            params::encode_query_prepared(buf, name, &packed)
        })
    }

    /// number of staged queries.
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    fn push_with<F>(&mut self, func: F) -> Result<usize, Error>
    where
        F: FnOnce(&OidMap, &mut BytesMut) -> Result<(), Error>,
    {
        let map = self.cli.type_map();
        let len = self.buf.len();
        // a failed push leaves the previously staged queries intact
        func(&map, &mut self.buf).inspect_err(|_| self.buf.truncate(len))?;
        let idx = self.queued;
        self.queued += 1;
        Ok(idx)
    }
}

impl Client {
    /// stage a batch of queries and flush them atomically under one sync
    /// barrier.
    ///
    /// on success the returned vector holds exactly one entry per staged
    /// query, in staging order. when a statement fails its entry carries
    /// the server error and every later entry carries
    /// [PipelineAborted]; the batch as a whole still completes.
    ///
    /// when `func` itself returns an error the staged bytes are replaced
    /// with a single `ROLLBACK;`, that is flushed and drained, and the
    /// caller receives [PipelineOperationFailed] wrapping the closure
    /// error.
    ///
    /// # Examples
    /// ```rust
    /// # use pgpipe::{Client, error::Error};
    /// # async fn example(client: &Client) -> Result<(), Error> {
    /// let res = client
    ///     .pipeline(|pipe| {
    ///         pipe.push_query("CREATE TEMP TABLE t(x INT)", ())?;
    ///         pipe.push_query("INSERT INTO t VALUES ($1), ($2)", (1, 2))?;
    ///         pipe.push_query("SELECT sum(x) FROM t", ())?;
    ///         Ok(())
    ///     })
    ///     .await?;
    ///
    /// assert_eq!(res.len(), 3);
    /// let sum = res[2].as_ref().unwrap().get(0)?.try_get::<i64>(0)?;
    /// assert_eq!(sum, 3);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn pipeline<F>(&self, func: F) -> Result<Vec<PipelineResult>, Error>
    where
        F: FnOnce(&mut Pipeline<'_>) -> Result<(), Error>,
    {
        let mut pipe = Pipeline {
            cli: self,
            buf: self.take_buf(),
            queued: 0,
        };

        if let Err(e) = func(&mut pipe) {
            let mut buf = pipe.buf;
            buf.clear();
            frontend::query("ROLLBACK;", &mut buf)?;
            // response intentionally dropped: the driver drains it
            let res = self.send_raw(buf.split(), 1);
            self.put_buf(buf);
            res?;
            return Err(PipelineOperationFailed::new(e).into());
        }

        let queued = pipe.queued;
        let mut buf = pipe.buf;

        if queued == 0 {
            self.put_buf(buf);
            return Ok(Vec::new());
        }

        frontend::sync(&mut buf);
        let res = self.send_raw(buf.split(), 1);
        self.put_buf(buf);

        collect_pipeline(res?, queued).await
    }
}

async fn collect_pipeline(mut res: Response, queued: usize) -> Result<Vec<PipelineResult>, Error> {
    let mut out = Vec::with_capacity(queued);
    let mut aborted = false;

    while out.len() < queued {
        if aborted {
            out.push(Err(PipelineAborted.into()));
            continue;
        }

        let mut status = ResultStatus::CommandOk;
        let mut columns = Vec::new();
        let mut rows = Vec::new();

        loop {
            match res.recv_raw().await? {
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
                backend::Message::CommandComplete(body) => {
                    let tag = Some(command_tag(&body)?);
                    out.push(Ok(Results::new(status, tag, columns, rows)));
                    break;
                }
                backend::Message::EmptyQueryResponse => {
                    out.push(Err(EmptyQuery.into()));
                    break;
                }
                backend::Message::ErrorResponse(body) => {
                    // the server skips the remaining statements up to the
                    // sync barrier
                    out.push(Err(Error::db(body.fields())));
                    aborted = true;
                    break;
                }
                // fewer results than staged statements
                backend::Message::ReadyForQuery(_) => return Err(Error::unexpected()),
                _ => return Err(Error::unexpected()),
            }
        }
    }

    // consume up to and including the sync barrier
    loop {
        match res.recv_raw().await? {
            backend::Message::ReadyForQuery(_) => return Ok(out),
            _ => {}
        }
    }
}
