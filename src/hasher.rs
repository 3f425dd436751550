// #️⃣ Order-independent hashing of persisted collections
//
// hash = fold(sorted member ids, h * 31 + id), starting at 0, wrapping on overflow.
// The hash only narrows the candidates; equal hashes still need a full comparison.
//
// Bags count repeated members, sets keep the first occurrence only.

use crate::entities::Persistable;
use crate::error::{DedupError, Result};
use crate::gateway::{column, Id, SqlValue};
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;

/// Hash a collection by the ids of its members. Every member must be persisted.
pub fn calculate_hash<I>(member_ids: I) -> Result<i64>
where
    I: IntoIterator<Item = Option<Id>>,
{
    let mut ids = member_ids
        .into_iter()
        .map(|id| {
            id.ok_or_else(|| {
                DedupError::not_persisted("hashed collection member without an id")
            })
        })
        .collect::<Result<Vec<Id>>>()?;
    ids.sort_unstable();

    Ok(ids
        .iter()
        .fold(0i64, |hash, id| hash.wrapping_mul(31).wrapping_add(*id)))
}

/// Where a hashed collection lives: a table of (id, hash) plus a member table
/// of (list_id, position, member_id).
pub trait CollectionSchema {
    type Member: Persistable;
    const TABLE: &'static str;
    const MEMBER_TABLE: &'static str;

    /// `false` makes the collection a set: a member added twice counts once.
    const BAG: bool = true;
}

/// Collection of persisted values with a cached, order-independent hash.
///
/// Members keep insertion order for display. Equality is the multiset (bag) or the
/// set of member ids, depending on the schema.
pub struct HashedCollection<S: CollectionSchema> {
    pub id: Option<Id>,
    members: Vec<S::Member>,
    hash: Option<i64>,
    _schema: PhantomData<S>,
}

impl<S: CollectionSchema> HashedCollection<S> {
    pub fn new() -> Self {
        HashedCollection {
            id: None,
            members: Vec::new(),
            hash: None,
            _schema: PhantomData,
        }
    }

    pub fn from_members(members: Vec<S::Member>) -> Self {
        HashedCollection {
            id: None,
            members,
            hash: None,
            _schema: PhantomData,
        }
    }

    /// Adding a member invalidates the cached hash.
    pub fn add(&mut self, member: S::Member) {
        self.members.push(member);
        self.hash = None;
    }

    pub fn members(&self) -> &[S::Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = Option<Id>> + '_ {
        self.members.iter().map(|m| m.id())
    }

    /// Cached hash, `None` until `calculate_hash` ran after the last change.
    pub fn hash(&self) -> Option<i64> {
        self.hash
    }

    pub fn calculate_hash(&mut self) -> Result<i64> {
        let hash = calculate_hash(self.stored_member_ids())?;
        self.hash = Some(hash);
        Ok(hash)
    }

    /// Member ids as they get stored, in insertion order. Sets drop repeated ids.
    pub fn stored_member_ids(&self) -> Vec<Option<Id>> {
        if S::BAG {
            return self.member_ids().collect();
        }
        let mut seen = HashSet::new();
        self.member_ids().filter(|id| seen.insert(*id)).collect()
    }

    pub(crate) fn sorted_member_ids(&self) -> Vec<Option<Id>> {
        let mut ids = self.stored_member_ids();
        ids.sort_unstable();
        ids
    }
}

impl<S: CollectionSchema> Default for HashedCollection<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: CollectionSchema> Clone for HashedCollection<S>
where
    S::Member: Clone,
{
    fn clone(&self) -> Self {
        HashedCollection {
            id: self.id,
            members: self.members.clone(),
            hash: self.hash,
            _schema: PhantomData,
        }
    }
}

impl<S: CollectionSchema> fmt::Debug for HashedCollection<S>
where
    S::Member: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashedCollection")
            .field("table", &S::TABLE)
            .field("id", &self.id)
            .field("hash", &self.hash)
            .field("members", &self.members)
            .finish()
    }
}

impl<S: CollectionSchema> PartialEq for HashedCollection<S> {
    fn eq(&self, other: &Self) -> bool {
        self.sorted_member_ids() == other.sorted_member_ids()
    }
}

/// The collection row itself is `(id, hash)`; members live in `S::MEMBER_TABLE`.
impl<S: CollectionSchema> Persistable for HashedCollection<S> {
    const TABLE: &'static str = S::TABLE;
    const COLUMNS: &'static [&'static str] = &["hash"];

    fn id(&self) -> Option<Id> {
        self.id
    }

    fn set_id(&mut self, id: Option<Id>) {
        self.id = id;
    }

    fn to_row(&self) -> Vec<SqlValue> {
        let hash = match self.hash {
            Some(hash) => Some(hash),
            None => calculate_hash(self.stored_member_ids()).ok(),
        };
        vec![hash.map_or(SqlValue::Null, SqlValue::Integer)]
    }

    /// Header only. `EqualityResolver::get_hashed_collection` loads the members.
    fn from_row(id: Id, row: &[SqlValue]) -> Result<Self> {
        let mut collection = Self::new();
        collection.id = Some(id);
        collection.hash = column(row, 0)?;
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ProteinAccnum, ProteinAccnumSet, ProteinSequence, ProteinSequenceList};

    fn seq(id: Id) -> ProteinSequence {
        ProteinSequence::new(&format!("SEQ{}", id)).with_id(id)
    }

    fn accnum(id: Id) -> ProteinAccnum {
        let mut accnum = ProteinAccnum::new(&format!("P{:05}", id));
        accnum.id = Some(id);
        accnum
    }

    #[test]
    fn test_hash_order_independent() {
        let permutations: [[Option<Id>; 3]; 6] = [
            [Some(1), Some(2), Some(3)],
            [Some(1), Some(3), Some(2)],
            [Some(2), Some(1), Some(3)],
            [Some(2), Some(3), Some(1)],
            [Some(3), Some(1), Some(2)],
            [Some(3), Some(2), Some(1)],
        ];

        // ((0*31 + 1)*31 + 2)*31 + 3
        for ids in permutations {
            assert_eq!(calculate_hash(ids).unwrap(), 1026);
        }
    }

    #[test]
    fn test_hash_of_empty_collection_is_zero() {
        assert_eq!(calculate_hash(Vec::<Option<Id>>::new()).unwrap(), 0);
    }

    #[test]
    fn test_hash_counts_repeated_members() {
        let once = calculate_hash([Some(5)]).unwrap();
        let twice = calculate_hash([Some(5), Some(5)]).unwrap();
        assert_ne!(once, twice);
    }

    #[test]
    fn test_hash_wraps_instead_of_overflowing() {
        let ids = vec![Some(i64::MAX); 4];
        assert!(calculate_hash(ids).is_ok());
    }

    #[test]
    fn test_unsaved_member_is_rejected() {
        let result = calculate_hash([Some(1), None, Some(3)]);
        assert!(matches!(result, Err(DedupError::NotPersisted { .. })));
    }

    #[test]
    fn test_add_invalidates_cached_hash() {
        let mut list: HashedCollection<ProteinSequenceList> = HashedCollection::new();
        list.add(seq(4));
        list.add(seq(2));
        assert_eq!(list.hash(), None);

        assert_eq!(list.calculate_hash().unwrap(), 2 * 31 + 4);
        list.add(seq(9));
        assert_eq!(list.hash(), None);

        // Insertion order is kept for display
        let ids: Vec<_> = list.member_ids().collect();
        assert_eq!(ids, vec![Some(4), Some(2), Some(9)]);
    }

    #[test]
    fn test_collision_is_not_equality() {
        // 31*1 + 40 == 31*2 + 9
        let a: HashedCollection<ProteinSequenceList> =
            HashedCollection::from_members(vec![seq(40), seq(1)]);
        let b: HashedCollection<ProteinSequenceList> =
            HashedCollection::from_members(vec![seq(2), seq(9)]);
        let c: HashedCollection<ProteinSequenceList> =
            HashedCollection::from_members(vec![seq(1), seq(40)]);

        assert_eq!(
            calculate_hash(a.member_ids()).unwrap(),
            calculate_hash(b.member_ids()).unwrap()
        );
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_set_counts_repeated_member_once() {
        let mut set: HashedCollection<ProteinAccnumSet> =
            HashedCollection::from_members(vec![accnum(5), accnum(3), accnum(5)]);
        let mut once: HashedCollection<ProteinAccnumSet> =
            HashedCollection::from_members(vec![accnum(3), accnum(5)]);

        assert_eq!(set.stored_member_ids(), vec![Some(5), Some(3)]);
        assert_eq!(set.calculate_hash().unwrap(), once.calculate_hash().unwrap());
        assert_eq!(set, once);
        // Members are still all kept for display
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_bag_counts_repeated_member_twice() {
        let mut bag: HashedCollection<ProteinSequenceList> =
            HashedCollection::from_members(vec![seq(5), seq(3), seq(5)]);
        let mut once: HashedCollection<ProteinSequenceList> =
            HashedCollection::from_members(vec![seq(3), seq(5)]);

        assert_eq!(bag.stored_member_ids().len(), 3);
        assert_ne!(bag.calculate_hash().unwrap(), once.calculate_hash().unwrap());
        assert_ne!(bag, once);
    }

    #[test]
    fn test_collection_row_is_its_hash() {
        let list: HashedCollection<ProteinSequenceList> =
            HashedCollection::from_members(vec![seq(1), seq(2)]);
        assert_eq!(list.to_row(), vec![SqlValue::Integer(33)]);

        let header = HashedCollection::<ProteinSequenceList>::from_row(7, &list.to_row()).unwrap();
        assert_eq!(header.id, Some(7));
        assert_eq!(header.hash(), Some(33));
        assert!(header.is_empty());
    }
}
