//! composite (record) wire format and the named composite declaration macro.
//!
//! wire layout: int32 member count, then per member int32 oid, int32 length
//! and that many payload bytes. anonymous tuples travel as the generic
//! record type; named composites carry the oids discovered for them.

use xitca_io::bytes::{BufMut, BytesMut};

use crate::error::{CodecError, Error};

use super::{expected_oid, oid, take_cell, take_i32, take_u32, verify_oid, FromSql, OidMap, OidPair, PgType, ToSql, Udt};

#[doc(hidden)]
pub fn encode_member_count(buf: &mut BytesMut, count: usize) {
    buf.put_i32(count as i32);
}

#[doc(hidden)]
pub fn size_of_member<T>(v: &T) -> usize
where
    T: ToSql,
{
    8 + v.size()
}

#[doc(hidden)]
pub fn encode_member<T>(v: &T, map: &OidMap, buf: &mut BytesMut) -> Result<(), Error>
where
    T: ToSql,
{
    buf.put_u32(T::oids(map)?.scalar);
    if v.is_null() {
        buf.put_i32(-1);
    } else {
        buf.put_i32(v.size() as i32);
        v.encode(map, buf)?;
    }
    Ok(())
}

#[doc(hidden)]
pub fn decode_member_count(buf: &mut &[u8], expected: usize) -> Result<(), Error> {
    let found = take_i32(buf)?;
    if found != expected as i32 {
        return Err(CodecError::MemberCount {
            expected,
            found: found.max(0) as usize,
        }
        .into());
    }
    Ok(())
}

#[doc(hidden)]
pub fn decode_member<'a, T>(map: &OidMap, buf: &mut &'a [u8]) -> Result<T, Error>
where
    T: FromSql<'a>,
{
    let found = take_u32(buf)?;
    verify_oid(found, expected_oid::<T>(map))?;
    match take_cell(buf)? {
        Some(cell) => T::decode(map, cell),
        None => T::decode_null(map),
    }
}

macro_rules! tuple_impl {
    ($($T: ident),+; $len: expr) => {
        impl<$($T),+> PgType for ($($T,)+)
        where
            $($T: PgType),+
        {
            fn oids(_: &OidMap) -> Result<OidPair, Error> {
                Ok(oid::RECORD)
            }

            fn visit_udts(map: &OidMap, out: &mut Vec<Udt>) {
                $($T::visit_udts(map, out);)+
            }
        }

        impl<$($T),+> ToSql for ($($T,)+)
        where
            $($T: ToSql),+
        {
            fn size(&self) -> usize {
                #[allow(non_snake_case)]
                let ($($T,)+) = self;
                4 $(+ size_of_member($T))+
            }

            fn encode(&self, map: &OidMap, buf: &mut BytesMut) -> Result<(), Error> {
                #[allow(non_snake_case)]
                let ($($T,)+) = self;
                encode_member_count(buf, $len);
                $(encode_member($T, map, buf)?;)+
                Ok(())
            }
        }

        impl<'a, $($T),+> FromSql<'a> for ($($T,)+)
        where
            $($T: FromSql<'a>),+
        {
            fn decode(map: &OidMap, raw: &'a [u8]) -> Result<Self, Error> {
                let mut buf = raw;
                decode_member_count(&mut buf, $len)?;
                Ok(($(decode_member::<$T>(map, &mut buf)?,)+))
            }
        }
    };
}

tuple_impl!(A; 1);
tuple_impl!(A, B; 2);
tuple_impl!(A, B, C; 3);
tuple_impl!(A, B, C, D; 4);
tuple_impl!(A, B, C, D, E; 5);
tuple_impl!(A, B, C, D, E, F; 6);
tuple_impl!(A, B, C, D, E, F, G; 7);
tuple_impl!(A, B, C, D, E, F, G, H; 8);
tuple_impl!(A, B, C, D, E, F, G, H, I; 9);
tuple_impl!(A, B, C, D, E, F, G, H, I, J; 10);
tuple_impl!(A, B, C, D, E, F, G, H, I, J, K; 11);
tuple_impl!(A, B, C, D, E, F, G, H, I, J, K, L; 12);
tuple_impl!(A, B, C, D, E, F, G, H, I, J, K, L, M; 13);
tuple_impl!(A, B, C, D, E, F, G, H, I, J, K, L, M, N; 14);
tuple_impl!(A, B, C, D, E, F, G, H, I, J, K, L, M, N, O; 15);
tuple_impl!(A, B, C, D, E, F, G, H, I, J, K, L, M, N, O, P; 16);

/// declare a Rust struct mirroring a composite type created on the server,
/// wiring it into the binary codec and oid discovery.
///
/// # Examples
/// ```rust
/// // CREATE TYPE employee AS (name TEXT, phone TEXT);
/// pgpipe::user_type! {
///     #[derive(Debug, PartialEq)]
///     pub struct Employee as "employee" {
///         pub name: String,
///         pub phone: String,
///     }
/// }
/// ```
///
/// the declared type implements `PgType`, `ToSql` and `FromSql` and can be
/// used as a query parameter, inside arrays and inside other composites.
/// its oids are discovered from the server on first use by the async query
/// paths, or explicitly with `Client::discover`.
#[macro_export]
macro_rules! user_type {
    (
        $(#[$attr: meta])*
        $vis: vis struct $name: ident as $pg_name: literal {
            $($(#[$f_attr: meta])* $f_vis: vis $field: ident: $ty: ty),+ $(,)?
        }
    ) => {
        $(#[$attr])*
        $vis struct $name {
            $($(#[$f_attr])* $f_vis $field: $ty,)+
        }

        impl $crate::types::PgType for $name {
            fn oids(
                map: &$crate::types::OidMap,
            ) -> ::core::result::Result<$crate::types::OidPair, $crate::error::Error> {
                map.resolved(::core::any::TypeId::of::<$name>(), $pg_name)
            }

            fn visit_udts(map: &$crate::types::OidMap, out: &mut ::std::vec::Vec<$crate::types::Udt>) {
                $crate::types::Udt::collect::<$name>($pg_name, map, out);
                $(<$ty as $crate::types::PgType>::visit_udts(map, out);)+
            }
        }

        impl $crate::types::ToSql for $name {
            fn size(&self) -> usize {
                4 $(+ $crate::types::size_of_member(&self.$field))+
            }

            fn encode(
                &self,
                map: &$crate::types::OidMap,
                buf: &mut $crate::types::BytesMut,
            ) -> ::core::result::Result<(), $crate::error::Error> {
                $crate::types::encode_member_count(buf, [$(stringify!($field)),+].len());
                $($crate::types::encode_member(&self.$field, map, buf)?;)+
                ::core::result::Result::Ok(())
            }
        }

        impl<'a> $crate::types::FromSql<'a> for $name {
            fn decode(
                map: &$crate::types::OidMap,
                raw: &'a [u8],
            ) -> ::core::result::Result<Self, $crate::error::Error> {
                let mut buf = raw;
                $crate::types::decode_member_count(&mut buf, [$(stringify!($field)),+].len())?;
                ::core::result::Result::Ok($name {
                    $($field: $crate::types::decode_member(map, &mut buf)?,)+
                })
            }
        }
    };
}

#[cfg(test)]
mod test {
    use core::any::TypeId;

    use super::*;

    crate::user_type! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Employee as "employee" {
            pub name: String,
            pub phone: String,
        }
    }

    crate::user_type! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Company as "company" {
            pub id: i64,
            pub employees: Vec<Employee>,
        }
    }

    fn resolved_map() -> OidMap {
        let mut map = OidMap::new();
        map.insert(TypeId::of::<Employee>(), "employee", OidPair::new(16384, 16385));
        map.insert(TypeId::of::<Company>(), "company", OidPair::new(16386, 16387));
        map
    }

    fn company() -> Company {
        Company {
            id: 104,
            employees: vec![
                Employee {
                    name: "Jane".into(),
                    phone: "555-1".into(),
                },
                Employee {
                    name: "Tom".into(),
                    phone: "555-2".into(),
                },
            ],
        }
    }

    #[test]
    fn tuple_round_trip() {
        let map = OidMap::new();
        let v = (42i32, String::from("x"), Some(1.5f64), None::<String>);
        let mut buf = BytesMut::new();
        v.encode(&map, &mut buf).unwrap();
        assert_eq!(v.size(), buf.len());
        let back = <(i32, String, Option<f64>, Option<String>)>::decode(&map, &buf).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn tuple_member_count_verified() {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        (1i32, 2i32).encode(&map, &mut buf).unwrap();
        let err = <(i32,)>::decode(&map, &buf).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CodecError>(),
            Some(&CodecError::MemberCount { expected: 1, found: 2 })
        );
    }

    #[test]
    fn tuple_member_oid_verified() {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        (1i32,).encode(&map, &mut buf).unwrap();
        let err = <(i64,)>::decode(&map, &buf).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CodecError>(),
            Some(&CodecError::OidMismatch { expected: 20, found: 23 })
        );
    }

    #[test]
    fn nested_composite_round_trip() {
        let map = resolved_map();
        let v = company();
        let mut buf = BytesMut::new();
        v.encode(&map, &mut buf).unwrap();
        assert_eq!(v.size(), buf.len());
        assert_eq!(Company::decode(&map, &buf).unwrap(), v);
    }

    #[test]
    fn unresolved_member_oid_skips_verification() {
        // encoded with resolved oids, decoded with an empty registry: the
        // expected oids of the user defined members fall back to 0 and the
        // checks are skipped.
        let resolved = resolved_map();
        let v = company();
        let mut buf = BytesMut::new();
        v.encode(&resolved, &mut buf).unwrap();
        assert_eq!(Company::decode(&OidMap::new(), &buf).unwrap(), v);
    }

    #[test]
    fn encode_requires_resolved_oids() {
        let map = OidMap::new();
        let mut buf = BytesMut::new();
        let err = company().encode(&map, &mut buf).unwrap_err();
        assert!(err.downcast_ref::<crate::error::UserTypeUnresolved>().is_some());
    }

    #[test]
    fn shape_walk_collects_nested_udts() {
        let map = OidMap::new();
        let mut out = Vec::new();
        <(Vec<Company>, i32)>::visit_udts(&map, &mut out);
        let names = out.iter().map(Udt::name).collect::<Vec<_>>();
        assert_eq!(names, ["company", "employee"]);

        // resolved types are not collected again
        let mut out = Vec::new();
        Company::visit_udts(&resolved_map(), &mut out);
        assert!(out.is_empty());
    }
}
