use core::any::TypeId;

use std::collections::HashMap;

use crate::error::{Error, UserTypeUnresolved};

use super::OidPair;

/// registry of user defined composite types resolved against the server.
///
/// keys are the compile time identity of the Rust type; values carry the
/// server side type name used for discovery and the discovered oid pair.
/// entries are only inserted after a successful discovery round trip.
#[derive(Default)]
pub struct OidMap {
    types: HashMap<TypeId, Entry>,
}

struct Entry {
    #[allow(dead_code)]
    name: &'static str,
    oids: OidPair,
}

impl OidMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// oid pair of a resolved user defined type.
    pub fn get(&self, id: &TypeId) -> Option<OidPair> {
        self.types.get(id).map(|e| e.oids)
    }

    pub fn contains(&self, id: &TypeId) -> bool {
        self.types.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    #[doc(hidden)]
    // support function for the impls generated by `user_type!`.
    pub fn resolved(&self, id: TypeId, name: &'static str) -> Result<OidPair, Error> {
        self.get(&id).ok_or_else(|| UserTypeUnresolved { name }.into())
    }

    pub(crate) fn insert(&mut self, id: TypeId, name: &'static str, oids: OidPair) {
        self.types.insert(id, Entry { name, oids });
    }
}

/// a user defined type collected by a shape walk, pending oid discovery.
pub struct Udt {
    pub(crate) name: &'static str,
    pub(crate) id: TypeId,
}

impl Udt {
    /// server side name the type will be discovered under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[doc(hidden)]
    // support function for the impls generated by `user_type!`.
    pub fn collect<T: 'static>(name: &'static str, map: &OidMap, out: &mut Vec<Udt>) {
        let id = TypeId::of::<T>();
        if !map.contains(&id) && !out.iter().any(|u| u.id == id) {
            out.push(Udt { name, id });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Marker;

    #[test]
    fn lookup() {
        let mut map = OidMap::new();
        let id = TypeId::of::<Marker>();

        map.resolved(id, "marker").unwrap_err();

        map.insert(id, "marker", OidPair::new(16384, 16385));
        assert_eq!(map.resolved(id, "marker").unwrap(), OidPair::new(16384, 16385));
    }

    #[test]
    fn collect_dedupes() {
        let map = OidMap::new();
        let mut out = Vec::new();
        Udt::collect::<Marker>("marker", &map, &mut out);
        Udt::collect::<Marker>("marker", &map, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "marker");
    }

    #[test]
    fn collect_skips_resolved() {
        let mut map = OidMap::new();
        map.insert(TypeId::of::<Marker>(), "marker", OidPair::new(1, 2));
        let mut out = Vec::new();
        Udt::collect::<Marker>("marker", &map, &mut out);
        assert!(out.is_empty());
    }
}
