//! materialized query results.

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::{self, DataRowBody, RowDescriptionBody};

use super::{error::Error, row::Row, types::Oid};

/// status a successfully completed statement finished with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultStatus {
    /// the statement completed without returning rows.
    CommandOk,
    /// the statement returned rows, possibly zero of them.
    TuplesOk,
}

/// metadata of one result column.
#[derive(Clone, Debug)]
pub struct Column {
    name: Box<str>,
    oid: Oid,
}

impl Column {
    pub(crate) fn new(name: &str, oid: Oid) -> Self {
        Self {
            name: Box::from(name),
            oid,
        }
    }

    /// name of the column.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// oid of the column's type.
    pub fn oid(&self) -> Oid {
        self.oid
    }
}

/// an owning handle over the complete response of one statement.
///
/// [`Row`] and [`Field`] are non owning views into this handle; their
/// lifetime ends with it.
///
/// [`Field`]: crate::row::Field
#[derive(Debug)]
pub struct Results {
    status: ResultStatus,
    tag: Option<Box<str>>,
    columns: Vec<Column>,
    rows: Vec<DataRowBody>,
}

impl Results {
    pub(crate) fn new(
        status: ResultStatus,
        tag: Option<Box<str>>,
        columns: Vec<Column>,
        rows: Vec<DataRowBody>,
    ) -> Self {
        Self {
            status,
            tag,
            columns,
            rows,
        }
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// number of rows in the result.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// metadata of the result columns.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// range checked row access.
    pub fn get(&self, idx: usize) -> Result<Row<'_>, Error> {
        match self.rows.get(idx) {
            Some(body) => Row::try_new(&self.columns, body),
            None => Err(crate::error::InvalidRowIndex(idx).into()),
        }
    }

    /// iterate over the rows of the result.
    pub fn iter(&self) -> impl Iterator<Item = Result<Row<'_>, Error>> {
        self.rows.iter().map(|body| Row::try_new(&self.columns, body))
    }

    /// rows affected by the statement as reported by its command tag.
    /// statements that do not modify rows report 0.
    pub fn rows_affected(&self) -> u64 {
        self.tag
            .as_deref()
            .and_then(|tag| tag.rsplit(' ').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

pub(crate) fn command_tag(body: &backend::CommandCompleteBody) -> Result<Box<str>, Error> {
    body.tag().map(Box::from).map_err(Into::into)
}

pub(crate) fn parse_columns(body: &RowDescriptionBody) -> Result<Vec<Column>, Error> {
    let mut columns = Vec::new();
    let mut fields = body.fields();
    while let Some(field) = fields.next()? {
        columns.push(Column::new(field.name(), field.type_oid()));
    }
    Ok(columns)
}

/// metadata of a prepared statement or portal fetched with a describe
/// operation.
#[derive(Debug)]
pub struct Description {
    params: Vec<Oid>,
    columns: Vec<Column>,
}

impl Description {
    pub(crate) fn new(params: Vec<Oid>, columns: Vec<Column>) -> Self {
        Self { params, columns }
    }

    /// oids of the statement's parameters. empty for portals.
    pub fn params(&self) -> &[Oid] {
        &self.params
    }

    /// metadata of the columns the statement yields.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}
