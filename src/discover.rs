//! oid discovery for user defined composite types.

use super::{
    client::{collect_single, Client},
    error::{Error, UserTypeNotFound},
    params::Params,
    types::{OidPair, PgType, Udt},
};

// resolves type names to their (scalar, array) oid pair, one row per input
// name in input order. a name the server does not know yields nulls.
const DISCOVER_QUERY: &str = "SELECT to_regtype(t)::oid, to_regtype(t || '[]')::oid FROM UNNEST($1::text[]) AS t";

// resolve every user defined type reachable from the parameter shapes of
// `P` that the client's registry does not know yet.
pub(crate) async fn resolve_params<P>(cli: &Client) -> Result<(), Error>
where
    P: Params,
{
    let pending = {
        let map = cli.type_map();
        let mut out = Vec::new();
        P::visit_udts(&map, &mut out);
        out
    };
    resolve_pending(cli, pending).await
}

pub(crate) async fn resolve_type<T>(cli: &Client) -> Result<(), Error>
where
    T: PgType,
{
    let pending = {
        let map = cli.type_map();
        let mut out = Vec::new();
        T::visit_udts(&map, &mut out);
        out
    };
    resolve_pending(cli, pending).await
}

async fn resolve_pending(cli: &Client, pending: Vec<Udt>) -> Result<(), Error> {
    if pending.is_empty() {
        return Ok(());
    }

    let names = pending.iter().map(Udt::name).collect::<Vec<_>>();

    // the discovery query itself only references built in types, so it is
    // sent through the non discovering path.
    let res = cli.send_query(DISCOVER_QUERY, &(names,))?;
    let res = collect_single(res).await?;

    if res.len() != pending.len() {
        return Err(Error::unexpected());
    }

    for (udt, row) in pending.iter().zip(res.iter()) {
        let (scalar, array) = row?.decode::<(Option<u32>, Option<u32>)>()?;
        match (scalar, array) {
            (Some(scalar), Some(array)) => cli.register_udt(udt, OidPair::new(scalar, array)),
            _ => return Err(UserTypeNotFound { name: udt.name() }.into()),
        }
    }

    Ok(())
}
