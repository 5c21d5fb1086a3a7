//! sled-backed persistence for the aggregates
//!
//! Each aggregate is one CBOR value in its own tree. Saves are
//! compare-and-swap against the exact bytes that were loaded, so two writers
//! working from the same snapshot cannot both succeed. Writes that touch more
//! than one key run in a sled transaction.
use super::afe::Afe;
use super::approval::ApprovalMatrixEntry;
use super::economics::EconomicsAnalysis;
use super::error::Error;
use super::interest::{JibStatement, WellInterests};
use sled::transaction::{ConflictableTransactionError, TransactionError, abort};
use sled::{IVec, Transactional, Tree};
use std::marker::PhantomData;
use std::sync::Arc;

/// A decoded value together with the bytes it was decoded from
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub key: String,
    pub value: T,
    raw: IVec,
}

impl<T> Snapshot<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

fn settle<R>(result: Result<R, TransactionError<Error>>) -> Result<R, Error> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => Error::Storage(e),
    })
}

fn concurrent_modification(entity: &str, key: &str) -> Error {
    tracing::warn!(entity, key, "optimistic concurrency check failed");
    Error::Conflict(format!("{entity} '{key}' was modified concurrently"))
}

/// Typed view over one sled tree
#[derive(Debug, Clone)]
pub struct Collection<T> {
    tree: Tree,
    entity: &'static str,
    _marker: PhantomData<T>,
}

impl<T> Collection<T>
where
    T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
{
    fn open(db: &sled::Db, name: &str, entity: &'static str) -> Result<Self, Error> {
        Ok(Self {
            tree: db.open_tree(name)?,
            entity,
            _marker: PhantomData,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<T>, Error> {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Load for a read-modify-write cycle
    pub fn load(&self, key: &str) -> Result<Snapshot<T>, Error> {
        let raw = self
            .tree
            .get(key.as_bytes())?
            .ok_or_else(|| Error::not_found(self.entity, key))?;
        Ok(Snapshot {
            key: key.to_string(),
            value: minicbor::decode(&raw)?,
            raw,
        })
    }

    pub fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    pub fn insert_new(&self, key: &str, value: &T) -> Result<(), Error> {
        let bytes = minicbor::to_vec(value)?;
        self.tree
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| Error::Conflict(format!("{} '{key}' already exists", self.entity)))
    }

    /// Write `value` over the snapshot, failing if the stored bytes changed
    /// since it was loaded.
    pub fn replace(&self, snapshot: &Snapshot<T>, value: &T) -> Result<(), Error> {
        let bytes = minicbor::to_vec(value)?;
        self.tree
            .compare_and_swap(snapshot.key.as_bytes(), Some(&snapshot.raw), Some(bytes))?
            .map_err(|_| concurrent_modification(self.entity, &snapshot.key))
    }

    pub fn remove(&self, snapshot: &Snapshot<T>) -> Result<(), Error> {
        self.tree
            .compare_and_swap(snapshot.key.as_bytes(), Some(&snapshot.raw), None as Option<&[u8]>)?
            .map_err(|_| concurrent_modification(self.entity, &snapshot.key))
    }

    pub fn scan(&self) -> Result<Vec<T>, Error> {
        self.tree
            .iter()
            .values()
            .map(|raw| Ok(minicbor::decode(&raw?)?))
            .collect()
    }

    pub fn scan_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Result<Vec<T>, Error> {
        let mut matching = vec![];
        for raw in self.tree.iter().values() {
            let value: T = minicbor::decode(&raw?)?;
            if predicate(&value) {
                matching.push(value);
            }
        }
        Ok(matching)
    }

    /// Insert a new value and claim its unique business key in `index`,
    /// both or neither. `index_label` names the key in conflict messages.
    pub fn insert_indexed(
        &self,
        key: &str,
        value: &T,
        index: &Tree,
        index_label: &str,
        index_key: &str,
    ) -> Result<(), Error> {
        let bytes = minicbor::to_vec(value)?;
        let entity = self.entity;
        let result = (&self.tree, index).transaction(|(tree, index)| {
            if index.get(index_key.as_bytes())?.is_some() {
                return abort(Error::Conflict(format!(
                    "{entity} {index_label} '{index_key}' already exists"
                )));
            }
            if tree.get(key.as_bytes())?.is_some() {
                return abort(Error::Conflict(format!("{entity} '{key}' already exists")));
            }
            tree.insert(key.as_bytes(), bytes.as_slice())?;
            index.insert(index_key.as_bytes(), key.as_bytes())?;
            Ok(())
        });
        settle(result)
    }

    /// Remove a value and release its business key, both or neither
    pub fn remove_indexed(
        &self,
        snapshot: &Snapshot<T>,
        index: &Tree,
        index_key: &str,
    ) -> Result<(), Error> {
        let entity = self.entity;
        let result = (&self.tree, index).transaction(|(tree, index)| {
            if tree.get(snapshot.key.as_bytes())?.as_ref() != Some(&snapshot.raw) {
                return abort(concurrent_modification(entity, &snapshot.key));
            }
            tree.remove(snapshot.key.as_bytes())?;
            index.remove(index_key.as_bytes())?;
            Ok(())
        });
        settle(result)
    }

    /// Replace two values of this collection atomically, each checked
    /// against its own snapshot.
    pub fn replace_pair(
        &self,
        first: (&Snapshot<T>, &T),
        second: (&Snapshot<T>, &T),
    ) -> Result<(), Error> {
        let writes = [
            (first.0, minicbor::to_vec(first.1)?),
            (second.0, minicbor::to_vec(second.1)?),
        ];
        let entity = self.entity;
        let result = self.tree.transaction(|tree| {
            for (snapshot, _) in &writes {
                if tree.get(snapshot.key.as_bytes())?.as_ref() != Some(&snapshot.raw) {
                    return abort(concurrent_modification(entity, &snapshot.key));
                }
            }
            for (snapshot, bytes) in &writes {
                tree.insert(snapshot.key.as_bytes(), bytes.as_slice())?;
            }
            Ok::<_, ConflictableTransactionError<Error>>(())
        });
        settle(result)
    }
}

/// All trees used by the engine, opened from one shared database handle
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<sled::Db>,
    pub afes: Collection<Afe>,
    // afe number -> afe id
    pub afe_numbers: Tree,
    pub analyses: Collection<EconomicsAnalysis>,
    // well id -> interests
    pub interests: Collection<WellInterests>,
    pub jib: Collection<JibStatement>,
    // well/partner/period -> statement id
    pub jib_periods: Tree,
    // keyed by matrix code
    pub matrix: Collection<ApprovalMatrixEntry>,
    sequences: Tree,
}

impl Store {
    pub fn open(db: Arc<sled::Db>) -> Result<Self, Error> {
        Ok(Self {
            afes: Collection::open(&db, "afes", "AFE")?,
            afe_numbers: db.open_tree("afe_numbers")?,
            analyses: Collection::open(&db, "economics_analyses", "economics analysis")?,
            interests: Collection::open(&db, "partner_interests", "well interests")?,
            jib: Collection::open(&db, "jib_statements", "JIB statement")?,
            jib_periods: db.open_tree("jib_periods")?,
            matrix: Collection::open(&db, "approval_matrix", "approval matrix entry")?,
            sequences: db.open_tree("sequences")?,
            db,
        })
    }

    /// Next number of a per-year series, starting at 1. Atomic across
    /// concurrent callers.
    pub fn next_sequence(&self, series: &str, year: i32) -> Result<u64, Error> {
        let key = format!("{series}/{year}");
        let stored = self.sequences.update_and_fetch(key.as_bytes(), |old| {
            let current = old
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some((current + 1).to_be_bytes().to_vec())
        })?;

        stored
            .and_then(|bytes| <[u8; 8]>::try_from(&bytes[..]).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| Error::Encoding(format!("sequence '{key}' holds an invalid counter")))
    }

    pub fn afe_id_by_number(&self, afe_number: &str) -> Result<Option<String>, Error> {
        Ok(self
            .afe_numbers
            .get(afe_number.as_bytes())?
            .map(|id| String::from_utf8_lossy(&id).into_owned()))
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}
