//! shape directed binary codec for postgres types.
//!
//! values travel in binary format only. a type's wire identity is its
//! (scalar, array) oid pair: built in types carry compile time pairs while
//! user defined composite types resolve theirs through the [OidMap]
//! registry, filled by oid discovery on first use.

mod registry;

pub(crate) mod record;

pub use registry::{OidMap, Udt};

#[doc(hidden)]
pub use record::{decode_member, decode_member_count, encode_member, encode_member_count, size_of_member};

pub use xitca_io::bytes::BytesMut;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use xitca_io::bytes::BufMut;

use super::error::{CodecError, Error};

/// object identifier the server assigns to every type.
pub type Oid = u32;

/// the scalar oid of a type together with the oid of its array type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OidPair {
    pub scalar: Oid,
    pub array: Oid,
}

impl OidPair {
    pub const fn new(scalar: Oid, array: Oid) -> Self {
        Self { scalar, array }
    }
}

/// oid pairs of the built in types this crate speaks.
pub mod oid {
    use super::OidPair;

    pub const BOOL: OidPair = OidPair::new(16, 1000);
    pub const BYTEA: OidPair = OidPair::new(17, 1001);
    pub const CHAR: OidPair = OidPair::new(18, 1002);
    pub const INT8: OidPair = OidPair::new(20, 1016);
    pub const INT2: OidPair = OidPair::new(21, 1005);
    pub const INT4: OidPair = OidPair::new(23, 1007);
    pub const TEXT: OidPair = OidPair::new(25, 1009);
    pub const OID: OidPair = OidPair::new(26, 1028);
    pub const FLOAT4: OidPair = OidPair::new(700, 1021);
    pub const FLOAT8: OidPair = OidPair::new(701, 1022);
    pub const TIMESTAMP: OidPair = OidPair::new(1114, 1115);
    pub const RECORD: OidPair = OidPair::new(2249, 2287);
}

// microseconds between the unix epoch and the postgres epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// wire level identity of a postgres type.
pub trait PgType {
    /// resolved oid pair of the type. user defined composites consult the
    /// registry and fail with [UserTypeUnresolved] before discovery ran.
    ///
    /// [UserTypeUnresolved]: crate::error::UserTypeUnresolved
    fn oids(map: &OidMap) -> Result<OidPair, Error>;

    /// collect user defined types reachable from this shape that the
    /// registry has not resolved yet. the walk descends into array elements
    /// and composite members.
    fn visit_udts(map: &OidMap, out: &mut Vec<Udt>) {
        let _ = (map, out);
    }
}

// expected scalar oid on the receive path. an unresolved user defined type
// yields 0 which disables verification for that value.
pub(crate) fn expected_oid<T: PgType>(map: &OidMap) -> Oid {
    T::oids(map).map(|p| p.scalar).unwrap_or(0)
}

pub(crate) fn verify_oid(found: Oid, expected: Oid) -> Result<(), Error> {
    if expected != 0 && found != expected {
        return Err(CodecError::OidMismatch { expected, found }.into());
    }
    Ok(())
}

/// a value that can be serialized into postgres binary format.
pub trait ToSql: PgType {
    /// exact number of payload bytes [ToSql::encode] writes for this value.
    fn size(&self) -> usize;

    /// append the binary representation of the value to `buf`.
    fn encode(&self, map: &OidMap, buf: &mut BytesMut) -> Result<(), Error>;

    /// null values are sent out of band as a negative wire length and oid 0.
    fn is_null(&self) -> bool {
        false
    }
}

/// a value that can be parsed from postgres binary format.
pub trait FromSql<'a>: PgType + Sized {
    fn decode(map: &OidMap, raw: &'a [u8]) -> Result<Self, Error>;

    /// invoked for cells with wire length -1.
    fn decode_null(map: &OidMap) -> Result<Self, Error> {
        let _ = map;
        Err(CodecError::UnexpectedNull.into())
    }
}

pub(crate) fn take_i32(buf: &mut &[u8]) -> Result<i32, Error> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated.into());
    }
    let v = BigEndian::read_i32(buf);
    *buf = &buf[4..];
    Ok(v)
}

pub(crate) fn take_u32(buf: &mut &[u8]) -> Result<u32, Error> {
    take_i32(buf).map(|v| v as u32)
}

// one length prefixed cell. None for wire length -1.
pub(crate) fn take_cell<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, Error> {
    let len = take_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.len() < len {
        return Err(CodecError::Truncated.into());
    }
    let (cell, rest) = buf.split_at(len);
    *buf = rest;
    Ok(Some(cell))
}

macro_rules! numeric {
    ($ty: ty, $oids: expr, $put: ident, $read: ident, $len: literal) => {
        impl PgType for $ty {
            fn oids(_: &OidMap) -> Result<OidPair, Error> {
                Ok($oids)
            }
        }

        impl ToSql for $ty {
            fn size(&self) -> usize {
                $len
            }

            fn encode(&self, _: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
                buf.$put(*self);
                Ok(())
            }
        }

        impl FromSql<'_> for $ty {
            fn decode(_: &OidMap, raw: &[u8]) -> Result<Self, Error> {
                if raw.len() != $len {
                    return Err(CodecError::Truncated.into());
                }
                Ok(BigEndian::$read(raw))
            }
        }
    };
}

numeric!(i16, oid::INT2, put_i16, read_i16, 2);
numeric!(i32, oid::INT4, put_i32, read_i32, 4);
numeric!(i64, oid::INT8, put_i64, read_i64, 8);
numeric!(u32, oid::OID, put_u32, read_u32, 4);
numeric!(f32, oid::FLOAT4, put_f32, read_f32, 4);
numeric!(f64, oid::FLOAT8, put_f64, read_f64, 8);

macro_rules! byte {
    ($ty: ty, $oids: expr, $put: ident, $get: expr) => {
        impl PgType for $ty {
            fn oids(_: &OidMap) -> Result<OidPair, Error> {
                Ok($oids)
            }
        }

        impl ToSql for $ty {
            fn size(&self) -> usize {
                1
            }

            fn encode(&self, _: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
                buf.$put(*self as _);
                Ok(())
            }
        }

        impl FromSql<'_> for $ty {
            fn decode(_: &OidMap, raw: &[u8]) -> Result<Self, Error> {
                match *raw {
                    [b] => Ok($get(b)),
                    _ => Err(CodecError::Truncated.into()),
                }
            }
        }
    };
}

byte!(bool, oid::BOOL, put_u8, |b| b != 0);
byte!(u8, oid::BYTEA, put_u8, |b| b);
byte!(i8, oid::CHAR, put_i8, |b| b as i8);

impl PgType for &str {
    fn oids(_: &OidMap) -> Result<OidPair, Error> {
        Ok(oid::TEXT)
    }
}

impl ToSql for &str {
    fn size(&self) -> usize {
        self.len()
    }

    fn encode(&self, _: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl<'a> FromSql<'a> for &'a str {
    fn decode(_: &OidMap, raw: &'a [u8]) -> Result<Self, Error> {
        core::str::from_utf8(raw).map_err(Into::into)
    }
}

impl PgType for String {
    fn oids(_: &OidMap) -> Result<OidPair, Error> {
        Ok(oid::TEXT)
    }
}

impl ToSql for String {
    fn size(&self) -> usize {
        self.len()
    }

    fn encode(&self, _: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl FromSql<'_> for String {
    fn decode(_: &OidMap, raw: &[u8]) -> Result<Self, Error> {
        core::str::from_utf8(raw).map(String::from).map_err(Into::into)
    }
}

impl PgType for SystemTime {
    fn oids(_: &OidMap) -> Result<OidPair, Error> {
        Ok(oid::TIMESTAMP)
    }
}

impl ToSql for SystemTime {
    fn size(&self) -> usize {
        8
    }

    fn encode(&self, _: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
        let unix_micros = match self.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as i64,
            Err(e) => -(e.duration().as_micros() as i64),
        };
        buf.put_i64(unix_micros - PG_EPOCH_OFFSET_MICROS);
        Ok(())
    }
}

impl FromSql<'_> for SystemTime {
    fn decode(map: &OidMap, raw: &[u8]) -> Result<Self, Error> {
        let unix_micros = i64::decode(map, raw)? + PG_EPOCH_OFFSET_MICROS;
        Ok(if unix_micros >= 0 {
            UNIX_EPOCH + Duration::from_micros(unix_micros as u64)
        } else {
            UNIX_EPOCH - Duration::from_micros(unix_micros.unsigned_abs())
        })
    }
}

impl<T> PgType for Option<T>
where
    T: PgType,
{
    fn oids(map: &OidMap) -> Result<OidPair, Error> {
        T::oids(map)
    }

    fn visit_udts(map: &OidMap, out: &mut Vec<Udt>) {
        T::visit_udts(map, out)
    }
}

impl<T> ToSql for Option<T>
where
    T: ToSql,
{
    fn size(&self) -> usize {
        self.as_ref().map_or(0, ToSql::size)
    }

    fn encode(&self, map: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Some(v) => v.encode(map, buf),
            None => Ok(()),
        }
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }
}

impl<'a, T> FromSql<'a> for Option<T>
where
    T: FromSql<'a>,
{
    fn decode(map: &OidMap, raw: &'a [u8]) -> Result<Self, Error> {
        T::decode(map, raw).map(Some)
    }

    fn decode_null(_: &OidMap) -> Result<Self, Error> {
        Ok(None)
    }
}

impl<T> PgType for Vec<T>
where
    T: PgType,
{
    fn oids(map: &OidMap) -> Result<OidPair, Error> {
        // arrays have no array type of their own
        T::oids(map).map(|p| OidPair::new(p.array, 0))
    }

    fn visit_udts(map: &OidMap, out: &mut Vec<Udt>) {
        T::visit_udts(map, out)
    }
}

impl<T> ToSql for Vec<T>
where
    T: ToSql,
{
    fn size(&self) -> usize {
        20 + self.iter().map(|v| 4 + v.size()).sum::<usize>()
    }

    fn encode(&self, map: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
        let elem = T::oids(map)?.scalar;
        buf.put_i32(1);
        buf.put_i32(0);
        buf.put_u32(elem);
        buf.put_i32(self.len() as i32);
        buf.put_i32(0);
        for v in self {
            if v.is_null() {
                buf.put_i32(-1);
            } else {
                buf.put_i32(v.size() as i32);
                v.encode(map, buf)?;
            }
        }
        Ok(())
    }
}

impl<'a, T> FromSql<'a> for Vec<T>
where
    T: FromSql<'a>,
{
    fn decode(map: &OidMap, raw: &'a [u8]) -> Result<Self, Error> {
        let mut buf = raw;

        let dims = take_i32(&mut buf)?;
        // the server encodes empty arrays with zero dimensions
        if dims == 0 {
            return Ok(Vec::new());
        }
        if dims != 1 {
            return Err(CodecError::MultiDimensionalArray { dims }.into());
        }

        let _has_nulls = take_i32(&mut buf)?;
        let elem = take_u32(&mut buf)?;
        verify_oid(elem, expected_oid::<T>(map))?;
        let len = take_i32(&mut buf)?.max(0) as usize;
        let _lower_bound = take_i32(&mut buf)?;

        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            let v = match take_cell(&mut buf)? {
                Some(cell) => T::decode(map, cell)?,
                None => T::decode_null(map)?,
            };
            out.push(v);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip<T>(v: T)
    where
        T: ToSql + for<'a> FromSql<'a> + PartialEq + core::fmt::Debug,
    {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        v.encode(&map, &mut buf).unwrap();
        assert_eq!(v.size(), buf.len(), "size must match encoded length");
        assert_eq!(T::decode(&map, &buf).unwrap(), v);
    }

    #[test]
    fn atoms() {
        round_trip(true);
        round_trip(false);
        round_trip(42i32);
        round_trip(i64::MIN);
        round_trip(7u32);
        round_trip(-3i16);
        round_trip(0xa5u8);
        round_trip(-1i8);
        round_trip(1.5f32);
        round_trip(-2.25f64);
        round_trip(String::from("hello"));
        round_trip(String::new());
    }

    #[test]
    fn borrowed_str() {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        "grüße".encode(&map, &mut buf).unwrap();
        assert_eq!("grüße".size(), buf.len());
        assert_eq!(<&str>::decode(&map, &buf).unwrap(), "grüße");
    }

    #[test]
    fn invalid_utf8_rejected() {
        let map = OidMap::new();
        String::decode(&map, &[0xff, 0xfe]).unwrap_err();
    }

    #[test]
    fn timestamps() {
        round_trip(UNIX_EPOCH + Duration::from_micros(1_234_567));
        // postgres epoch
        round_trip(UNIX_EPOCH + Duration::from_micros(946_684_800_000_000));
        // before the unix epoch
        round_trip(UNIX_EPOCH - Duration::from_micros(5_000_000));
    }

    #[test]
    fn array() {
        round_trip(vec![1i32, 2, 3]);
        round_trip(vec![String::from("1"), String::from("2"), String::from("3")]);
        round_trip(Vec::<i64>::new());
        round_trip(vec![Some(1i32), None, Some(3)]);
    }

    #[test]
    fn array_header_layout() {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        vec![256i32].encode(&map, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            [
                0, 0, 0, 1, // dims
                0, 0, 0, 0, // has_nulls
                0, 0, 0, 23, // element oid int4
                0, 0, 0, 1, // length
                0, 0, 0, 0, // lower bound
                0, 0, 0, 4, 0, 0, 1, 0, // one element
            ]
        );
    }

    #[test]
    fn zero_dimension_array_is_empty() {
        // server encoding of `{}`: no dimensions at all
        let map = OidMap::new();
        let raw = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 23];
        assert_eq!(Vec::<i32>::decode(&map, &raw).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn multi_dimensional_array_rejected() {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        buf.put_i32(2);
        buf.put_i32(0);
        buf.put_u32(23);
        buf.put_i32(0);
        buf.put_i32(0);
        let err = Vec::<i32>::decode(&map, &buf).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CodecError>(),
            Some(&CodecError::MultiDimensionalArray { dims: 2 })
        );
    }

    #[test]
    fn array_element_oid_verified() {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        vec![1i32].encode(&map, &mut buf).unwrap();
        let err = Vec::<i64>::decode(&map, &buf).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CodecError>(),
            Some(&CodecError::OidMismatch { expected: 20, found: 23 })
        );
    }

    #[test]
    fn null_into_non_option_rejected() {
        let map = OidMap::new();
        let err = i32::decode_null(&map).unwrap_err();
        assert_eq!(err.downcast_ref::<CodecError>(), Some(&CodecError::UnexpectedNull));
    }

    #[test]
    fn truncated_cell_rejected() {
        let map = OidMap::new();
        let err = i32::decode(&map, &[0, 1]).unwrap_err();
        assert_eq!(err.downcast_ref::<CodecError>(), Some(&CodecError::Truncated));
    }
}
