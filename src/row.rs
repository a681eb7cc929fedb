//! non owning row and field views into a [Results] handle.

use core::{fmt, ops::Range};

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::DataRowBody;

use super::{
    error::{Error, InvalidColumnIndex, InvalidColumnName},
    result::{Column, Results},
    types::{expected_oid, verify_oid, FromSql, Oid, OidMap},
};

/// one row of a [Results] handle.
pub struct Row<'a> {
    columns: &'a [Column],
    body: &'a DataRowBody,
    ranges: Vec<Option<Range<usize>>>,
}

impl fmt::Debug for Row<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row").field("columns", &self.columns).finish()
    }
}

impl<'a> Row<'a> {
    pub(crate) fn try_new(columns: &'a [Column], body: &'a DataRowBody) -> Result<Self, Error> {
        let mut iter = body.ranges();
        let mut ranges = Vec::with_capacity(iter.size_hint().0);
        while let Some(range) = iter.next()? {
            ranges.push(range);
        }
        Ok(Self { columns, body, ranges })
    }

    /// number of fields in the row.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn columns(&self) -> &'a [Column] {
        self.columns
    }

    /// range checked field access by position or column name.
    pub fn field(&self, idx: impl RowIndex) -> Result<Field<'a>, Error> {
        let idx = idx.__index(self.columns)?;
        let raw = self
            .ranges
            .get(idx)
            .and_then(Clone::clone)
            .map(|r| &self.body.buffer()[r]);
        Ok(Field {
            column: &self.columns[idx],
            raw,
        })
    }

    /// iterate over the fields of the row.
    pub fn fields(&self) -> impl Iterator<Item = Field<'a>> + '_ {
        (0..self.len()).map(|idx| Field {
            column: &self.columns[idx],
            raw: self
                .ranges
                .get(idx)
                .and_then(Clone::clone)
                .map(|r| &self.body.buffer()[r]),
        })
    }

    /// decode the field at `idx`.
    ///
    /// # Panics
    /// panics when the index is out of bounds or the value fails to decode.
    /// see [Row::try_get] for the fallible version.
    pub fn get<T>(&self, idx: impl RowIndex + fmt::Display) -> T
    where
        T: FromSql<'a>,
    {
        self.try_get(&idx)
            .unwrap_or_else(|e| panic!("error retrieving column {idx}: {e}"))
    }

    /// decode the field at `idx`, verifying the field's wire oid against
    /// the expected type.
    ///
    /// user defined composites decoded through this method skip the oid
    /// check on their outermost value (their oids live in the client's
    /// registry); use [Row::try_get_with] for full verification.
    pub fn try_get<T>(&self, idx: impl RowIndex) -> Result<T, Error>
    where
        T: FromSql<'a>,
    {
        self.try_get_with(idx, &OidMap::new())
    }

    /// [Row::try_get] with a registry to verify user defined type oids
    /// against.
    pub fn try_get_with<T>(&self, idx: impl RowIndex, map: &OidMap) -> Result<T, Error>
    where
        T: FromSql<'a>,
    {
        self.field(idx)?.value_with(map)
    }

    /// decode successive fields `0..N` into a tuple of values.
    pub fn decode<T>(&self) -> Result<T, Error>
    where
        T: FromRow<'a>,
    {
        self.decode_with(&OidMap::new())
    }

    /// [Row::decode] with a registry to verify user defined type oids
    /// against.
    pub fn decode_with<T>(&self, map: &OidMap) -> Result<T, Error>
    where
        T: FromRow<'a>,
    {
        T::from_row(self, map)
    }
}

/// one field of a [Row].
#[derive(Clone, Copy)]
pub struct Field<'a> {
    column: &'a Column,
    raw: Option<&'a [u8]>,
}

impl<'a> Field<'a> {
    /// name of the field's column.
    pub fn name(&self) -> &'a str {
        self.column.name()
    }

    /// oid of the field's type.
    pub fn oid(&self) -> Oid {
        self.column.oid()
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// raw binary payload of the field. `None` for null cells.
    pub fn raw(&self) -> Option<&'a [u8]> {
        self.raw
    }

    /// decode the field after verifying its wire oid against the expected
    /// type. verification is skipped when the expected oid is unknown, i.e.
    /// for user defined types absent from `map`.
    pub fn value_with<T>(&self, map: &OidMap) -> Result<T, Error>
    where
        T: FromSql<'a>,
    {
        verify_oid(self.oid(), expected_oid::<T>(map))?;
        match self.raw {
            Some(raw) => T::decode(map, raw),
            None => T::decode_null(map),
        }
    }

    /// [Field::value_with] against an empty registry.
    pub fn value<T>(&self) -> Result<T, Error>
    where
        T: FromSql<'a>,
    {
        self.value_with(&OidMap::new())
    }
}

impl fmt::Debug for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name())
            .field("oid", &self.oid())
            .field("is_null", &self.is_null())
            .finish()
    }
}

mod sealed {
    pub trait Sealed {}
}

/// row field lookup by position or column name.
pub trait RowIndex: sealed::Sealed {
    #[doc(hidden)]
    fn __index(&self, columns: &[Column]) -> Result<usize, Error>;
}

impl sealed::Sealed for usize {}

impl RowIndex for usize {
    fn __index(&self, columns: &[Column]) -> Result<usize, Error> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(InvalidColumnIndex(*self).into())
        }
    }
}

impl sealed::Sealed for str {}

impl RowIndex for str {
    fn __index(&self, columns: &[Column]) -> Result<usize, Error> {
        columns
            .iter()
            .position(|c| c.name() == self)
            .ok_or_else(|| InvalidColumnName(self.to_string()).into())
    }
}

impl<T> sealed::Sealed for &T where T: RowIndex + ?Sized {}

impl<T> RowIndex for &T
where
    T: RowIndex + ?Sized,
{
    fn __index(&self, columns: &[Column]) -> Result<usize, Error> {
        T::__index(self, columns)
    }
}

/// decoding of a full row into a tuple of values, column by column.
pub trait FromRow<'a>: Sized {
    fn from_row(row: &Row<'a>, map: &OidMap) -> Result<Self, Error>;
}

macro_rules! from_row_impl {
    ($($T: ident => $idx: tt),+) => {
        impl<'a, $($T),+> FromRow<'a> for ($($T,)+)
        where
            $($T: FromSql<'a>),+
        {
            fn from_row(row: &Row<'a>, map: &OidMap) -> Result<Self, Error> {
                Ok(($(row.try_get_with::<$T>($idx, map)?,)+))
            }
        }
    };
}

from_row_impl!(A => 0);
from_row_impl!(A => 0, B => 1);
from_row_impl!(A => 0, B => 1, C => 2);
from_row_impl!(A => 0, B => 1, C => 2, D => 3);
from_row_impl!(A => 0, B => 1, C => 2, D => 3, E => 4);
from_row_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
from_row_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
from_row_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);

// keep the borrow based iteration ergonomic for `for` loops over results.
impl<'a> IntoIterator for &'a Results {
    type Item = Result<Row<'a>, Error>;
    type IntoIter = Rows<'a>;

    fn into_iter(self) -> Self::IntoIter {
        Rows {
            results: self,
            next: 0,
        }
    }
}

/// iterator over the rows of a [Results] handle.
pub struct Rows<'a> {
    results: &'a Results,
    next: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Result<Row<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == self.results.len() {
            return None;
        }
        let row = self.results.get(self.next);
        self.next += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.results.len() - self.next;
        (rem, Some(rem))
    }
}
