use std::collections::HashMap;
use std::hash::Hash;
use std::str::FromStr;

use flamenco_core::Error;
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> flamenco_core::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::internal(anyhow::anyhow!("malformed uuid {s:?}: {e}")))
}

pub(crate) fn parse_status<T>(s: &str) -> flamenco_core::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse::<T>().map_err(|e| Error::internal(anyhow::Error::new(e)))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> flamenco_core::Result<T> {
    serde_json::from_str(s).map_err(|e| Error::internal(anyhow::Error::new(e)))
}

/// Build a status → count histogram from `(status, count)` rows, filling in
/// zero for any status in `all` that had no rows.
pub(crate) fn histogram<S>(rows: Vec<(String, i64)>, all: &[S]) -> flamenco_core::Result<HashMap<S, u64>>
where
    S: FromStr + Eq + Hash + Copy,
    S::Err: std::error::Error + Send + Sync + 'static,
{
    let mut out: HashMap<S, u64> = all.iter().map(|s| (*s, 0)).collect();
    for (status, count) in rows {
        let status: S = parse_status(&status)?;
        out.insert(status, count.max(0) as u64);
    }
    Ok(out)
}
