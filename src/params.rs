//! typed query parameters and their wire form.

use core::ops::Range;

use postgres_protocol::{message::frontend, IsNull};
use xitca_io::bytes::BytesMut;

use super::{
    error::Error,
    types::{Oid, OidMap, ToSql, Udt},
};

/// an ordered set of typed query parameters populating `$1..$N`.
///
/// implemented for tuples of up to 16 [ToSql] values; `()` is the empty
/// set. single parameters are written as one element tuples: `(42,)`.
pub trait Params {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// total payload bytes packing will write. used to reserve exact buffer
    /// space up front.
    fn size_hint(&self) -> usize;

    /// collect unresolved user defined types reachable from the parameter
    /// shapes.
    fn visit_udts(map: &OidMap, out: &mut Vec<Udt>);

    /// append every value to the packer in order.
    fn pack(&self, map: &OidMap, dst: &mut PackedParams) -> Result<(), Error>;
}

impl Params for () {
    fn len(&self) -> usize {
        0
    }

    fn size_hint(&self) -> usize {
        0
    }

    fn visit_udts(_: &OidMap, _: &mut Vec<Udt>) {}

    fn pack(&self, _: &OidMap, _: &mut PackedParams) -> Result<(), Error> {
        Ok(())
    }
}

macro_rules! params_impl {
    ($($T: ident => $idx: tt),+) => {
        impl<$($T),+> Params for ($($T,)+)
        where
            $($T: ToSql),+
        {
            fn len(&self) -> usize {
                [$(stringify!($T)),+].len()
            }

            fn size_hint(&self) -> usize {
                0 $(+ self.$idx.size())+
            }

            fn visit_udts(map: &OidMap, out: &mut Vec<Udt>) {
                $($T::visit_udts(map, out);)+
            }

            fn pack(&self, map: &OidMap, dst: &mut PackedParams) -> Result<(), Error> {
                $(dst.push(map, &self.$idx)?;)+
                Ok(())
            }
        }
    };
}

params_impl!(A => 0);
params_impl!(A => 0, B => 1);
params_impl!(A => 0, B => 1, C => 2);
params_impl!(A => 0, B => 1, C => 2, D => 3);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10, L => 11);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10, L => 11, M => 12);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10, L => 11, M => 12, N => 13);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10, L => 11, M => 12, N => 13, O => 14);
params_impl!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7, I => 8, J => 9, K => 10, L => 11, M => 12, N => 13, O => 14, P => 15);

/// parameters packed into wire form: resolved oids and value ranges over
/// one contiguous buffer, all values in binary format.
///
/// offsets are recorded as ranges and resolved into slices only after every
/// write finished, so buffer growth never invalidates them. a null
/// parameter carries oid 0 and no bytes; on the wire it becomes length -1.
pub struct PackedParams {
    oids: Vec<Oid>,
    values: Vec<Option<Range<usize>>>,
    buf: BytesMut,
}

impl PackedParams {
    pub(crate) fn new<P>(map: &OidMap, params: &P) -> Result<Self, Error>
    where
        P: Params,
    {
        let mut dst = Self {
            oids: Vec::with_capacity(params.len()),
            values: Vec::with_capacity(params.len()),
            buf: BytesMut::with_capacity(params.size_hint()),
        };
        params.pack(map, &mut dst)?;
        Ok(dst)
    }

    pub(crate) fn push<T>(&mut self, map: &OidMap, v: &T) -> Result<(), Error>
    where
        T: ToSql,
    {
        if v.is_null() {
            self.oids.push(0);
            self.values.push(None);
            return Ok(());
        }
        self.oids.push(T::oids(map)?.scalar);
        let start = self.buf.len();
        v.encode(map, &mut self.buf)?;
        self.values.push(Some(start..self.buf.len()));
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.oids.len()
    }

    #[cfg(test)]
    fn value(&self, idx: usize) -> Option<&[u8]> {
        self.values[idx].as_ref().map(|r| &self.buf[r.start..r.end])
    }
}

// extended query message sequence for one unnamed statement, without the
// trailing sync.
pub(crate) fn encode_query(buf: &mut BytesMut, sql: &str, params: &PackedParams) -> Result<(), Error> {
    frontend::parse("", sql, params.oids.iter().copied(), buf)?;
    encode_bind("", params, buf)?;
    frontend::describe(b'P', "", buf)?;
    frontend::execute("", 0, buf)?;
    Ok(())
}

// bind/describe/execute against a previously prepared statement.
pub(crate) fn encode_query_prepared(buf: &mut BytesMut, name: &str, params: &PackedParams) -> Result<(), Error> {
    encode_bind(name, params, buf)?;
    frontend::describe(b'P', "", buf)?;
    frontend::execute("", 0, buf)?;
    Ok(())
}

fn encode_bind(stmt: &str, params: &PackedParams, buf: &mut BytesMut) -> Result<(), Error> {
    frontend::bind(
        "",
        stmt,
        params.values.iter().map(|_| 1i16),
        params.values.iter(),
        |value, buf| match value {
            Some(r) => {
                buf.extend_from_slice(&params.buf[r.start..r.end]);
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        },
        Some(1),
        buf,
    )
    .map_err(|e| match e {
        frontend::BindError::Conversion(e) => Error::boxed(e),
        frontend::BindError::Serialization(e) => Error::from(e),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packing_layout() {
        let map = OidMap::new();
        let params = (42i32, None::<String>, "abc");
        let packed = PackedParams::new(&map, &params).unwrap();

        assert_eq!(packed.len(), 3);
        assert_eq!(packed.oids, [23, 0, 25]);
        assert_eq!(packed.value(0), Some(&[0u8, 0, 0, 42][..]));
        assert_eq!(packed.value(1), None);
        assert_eq!(packed.value(2), Some(&b"abc"[..]));
        assert_eq!(params.size_hint(), packed.buf.len());
    }

    #[test]
    fn empty_params() {
        let map = OidMap::new();
        let packed = PackedParams::new(&map, &()).unwrap();
        assert_eq!(packed.len(), 0);
    }

    #[test]
    fn frame_sequence() {
        let map = OidMap::new();
        let packed = PackedParams::new(&map, &(1i16,)).unwrap();
        let mut buf = BytesMut::new();
        encode_query(&mut buf, "SELECT $1", &packed).unwrap();

        // Parse, Bind, Describe portal, Execute
        assert_eq!(buf[0], b'P');
        let tags = frame_tags(&buf);
        assert_eq!(tags, [b'P', b'B', b'D', b'E']);
    }

    fn frame_tags(mut buf: &[u8]) -> Vec<u8> {
        let mut tags = Vec::new();
        while !buf.is_empty() {
            tags.push(buf[0]);
            let len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
            buf = &buf[1 + len..];
        }
        tags
    }
}
