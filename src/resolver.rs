// ⚖️ Equality Resolver - find-equal-or-insert / find-equal-or-merge
//
// Guarantees at most one stored row per logically-equal value for single saves.
// The caller owns isolation: lookup-then-act is only safe inside a transaction
// that holds the write lock (see `gateway::unit_of_work`).

use crate::criteria::Criteria;
use crate::db::{get_change, save_change, Change};
use crate::entities::{Evolvable, Persistable};
use crate::error::{DedupError, Result};
use crate::gateway::{column, Id, SqlValue, StorageGateway};
use crate::hasher::{CollectionSchema, HashedCollection};
use log::{debug, warn};
use std::collections::HashMap;

pub struct EqualityResolver<'g, G: StorageGateway + ?Sized> {
    gateway: &'g G,
}

impl<'g, G: StorageGateway + ?Sized> EqualityResolver<'g, G> {
    pub fn new(gateway: &'g G) -> Self {
        EqualityResolver { gateway }
    }

    // ========================================================================
    // PLAIN VALUES
    // ========================================================================

    /// Save an item, reusing the stored row the criteria point at.
    ///
    /// - nothing matches: insert, the item gets a fresh id
    /// - match + `create_new`: `DuplicateValue`
    /// - match equal to the item: auxiliary fields are merged into the stored row
    /// - match not equal to the item: `BrokenEquality`
    ///
    /// Versioned types are rejected, they go through `save_evolvable`.
    pub fn save<T: Persistable>(&self, item: T, criteria: &Criteria, create_new: bool) -> Result<T> {
        reject_versioned::<T>()?;
        let candidates = self.find::<T>(criteria)?;
        if candidates.len() > 1 {
            warn!(
                "Table {} contains {} entries matching [{}], using the first one",
                T::TABLE,
                candidates.len(),
                criteria.to_sql(1).0
            );
        }

        if let Some(existing) = candidates.into_iter().next() {
            if create_new {
                return Err(DedupError::DuplicateValue {
                    entity: T::entity_name().to_string(),
                });
            }
            if item != existing {
                return Err(DedupError::BrokenEquality {
                    entity: T::entity_name().to_string(),
                });
            }
            return self.merge(item, stored_id(&existing)?);
        }

        self.insert(item)
    }

    /// Like `save`, but the criteria may match several rows.
    /// The first candidate (storage order) that is `==` to the item wins.
    pub fn save_lax_equality<T: Persistable>(
        &self,
        item: T,
        criteria: &Criteria,
        create_new: bool,
    ) -> Result<T> {
        reject_versioned::<T>()?;
        let candidates = self.find::<T>(criteria)?;
        let scanned = candidates.len();

        if let Some(existing) = candidates.into_iter().find(|c| *c == item) {
            if create_new {
                return Err(DedupError::DuplicateValue {
                    entity: T::entity_name().to_string(),
                });
            }
            return self.merge(item, stored_id(&existing)?);
        }

        if scanned > 0 {
            debug!(
                "{} candidates in {} matched loosely, none equal - inserting",
                scanned,
                T::TABLE
            );
        }
        self.insert(item)
    }

    pub fn get<T: Persistable>(&self, id: Id) -> Result<Option<T>> {
        match self.gateway.get(T::TABLE, T::COLUMNS, id)? {
            Some(row) => Ok(Some(T::from_row(id, &row)?)),
            None => Ok(None),
        }
    }

    /// All rows of the table, deleted ones included.
    pub fn row_count<T: Persistable>(&self) -> Result<i64> {
        crate::db::row_count(self.gateway, T::TABLE)
    }

    fn find<T: Persistable>(&self, criteria: &Criteria) -> Result<Vec<T>> {
        let (where_sql, params) = criteria.to_sql(1);
        let sql = format!(
            "SELECT id, {} FROM {} WHERE {} ORDER BY id",
            T::COLUMNS.join(", "),
            T::TABLE,
            where_sql
        );

        let mut found = Vec::new();
        self.gateway.execute_query(&sql, &params, &mut |row| {
            found.push(T::from_row(column(row, 0)?, &row[1..])?);
            Ok(())
        })?;
        Ok(found)
    }

    fn insert<T: Persistable>(&self, mut item: T) -> Result<T> {
        item.set_id(None);
        let id = self.gateway.insert(T::TABLE, T::COLUMNS, &item.to_row())?;
        item.set_id(Some(id));
        debug!("Inserted {} #{}", T::TABLE, id);
        Ok(item)
    }

    /// Item equals the stored row: take over its id and write the non-equality fields.
    fn merge<T: Persistable>(&self, mut item: T, existing_id: Id) -> Result<T> {
        let assignments = T::COLUMNS
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            T::TABLE,
            assignments,
            T::COLUMNS.len() + 1
        );

        let mut params = item.to_row();
        params.push(SqlValue::Integer(existing_id));
        self.gateway.execute_update(&sql, &params)?;

        item.set_id(Some(existing_id));
        debug!("Reused {} #{}", T::TABLE, existing_id);
        Ok(item)
    }

    // ========================================================================
    // HASHED COLLECTIONS
    // ========================================================================

    /// Store a collection once per distinct member multiset.
    ///
    /// Candidates come from the hash, every candidate is then compared member by member.
    /// A hash match that differs is a collision and simply falls through to insertion.
    pub fn update_hashed_collection<S: CollectionSchema>(
        &self,
        collection: &mut HashedCollection<S>,
    ) -> Result<Id> {
        let hash = collection.calculate_hash()?;
        let wanted = collection.sorted_member_ids();

        let candidates = self
            .gateway
            .query_rows(
                &format!("SELECT id FROM {} WHERE hash = ?1 ORDER BY id", S::TABLE),
                &[SqlValue::Integer(hash)],
            )?
            .iter()
            .map(|row| column::<Id>(row, 0))
            .collect::<Result<Vec<_>>>()?;

        for candidate in candidates {
            if self.stored_member_ids::<S>(candidate)? == wanted {
                collection.id = Some(candidate);
                debug!("Reused {} #{} (hash {})", S::TABLE, candidate, hash);
                return Ok(candidate);
            }
            debug!("Hash collision on {} #{} (hash {})", S::TABLE, candidate, hash);
        }

        let id = self
            .gateway
            .insert(S::TABLE, &["hash"], &[SqlValue::Integer(hash)])?;
        for (position, member_id) in collection.stored_member_ids().into_iter().enumerate() {
            self.gateway.insert(
                S::MEMBER_TABLE,
                &["list_id", "position", "member_id"],
                &[
                    SqlValue::Integer(id),
                    SqlValue::Integer(position as i64),
                    member_id.map_or(SqlValue::Null, SqlValue::Integer),
                ],
            )?;
        }
        collection.id = Some(id);
        debug!("Inserted {} #{} with {} members", S::TABLE, id, collection.len());
        Ok(id)
    }

    /// Load a stored collection with its members in their original order.
    pub fn get_hashed_collection<S: CollectionSchema>(
        &self,
        id: Id,
    ) -> Result<Option<HashedCollection<S>>> {
        if self.gateway.get(S::TABLE, &["hash"], id)?.is_none() {
            return Ok(None);
        }

        let member_columns = <S::Member as Persistable>::COLUMNS
            .iter()
            .map(|c| format!("s.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT s.id, {} FROM {} AS m JOIN {} AS s ON s.id = m.member_id
             WHERE m.list_id = ?1 ORDER BY m.position",
            member_columns,
            S::MEMBER_TABLE,
            <S::Member as Persistable>::TABLE
        );

        let mut members = Vec::new();
        self.gateway
            .execute_query(&sql, &[SqlValue::Integer(id)], &mut |row| {
                members.push(<S::Member as Persistable>::from_row(column(row, 0)?, &row[1..])?);
                Ok(())
            })?;

        let mut collection = HashedCollection::from_members(members);
        collection.id = Some(id);
        collection.calculate_hash()?;
        Ok(Some(collection))
    }

    fn stored_member_ids<S: CollectionSchema>(&self, list_id: Id) -> Result<Vec<Option<Id>>> {
        let mut ids = Vec::new();
        self.gateway.execute_query(
            &format!("SELECT member_id FROM {} WHERE list_id = ?1", S::MEMBER_TABLE),
            &[SqlValue::Integer(list_id)],
            &mut |row| {
                ids.push(column::<Option<Id>>(row, 0)?);
                Ok(())
            },
        )?;
        ids.sort_unstable();
        Ok(ids)
    }

    // ========================================================================
    // EVOLVABLE ENTITIES
    // ========================================================================

    /// Versioned save. Only live (non-deleted) rows are considered.
    ///
    /// - equal live row: reuse id, creation and deletion, merge auxiliary fields
    /// - live row matching the criteria but not equal: it is deleted by `change`
    ///   and the item is inserted as its successor
    /// - no match: insert with `creation = change`
    pub fn save_evolvable<T: Evolvable>(
        &self,
        mut item: T,
        change: &mut Change,
        criteria: &Criteria,
        create_new: bool,
    ) -> Result<T> {
        item.ensure_active()?;

        let mut candidates = self.find_live::<T>(Some(criteria))?;
        if candidates.len() > 1 {
            warn!(
                "Table {} contains {} live entries matching [{}], using the first one",
                T::TABLE,
                candidates.len(),
                criteria.to_sql(1).0
            );
        }
        let existing = if candidates.is_empty() {
            None
        } else {
            Some(candidates.swap_remove(0))
        };

        if let Some(existing) = &existing {
            if create_new {
                return Err(DedupError::DuplicateValue {
                    entity: T::entity_name().to_string(),
                });
            }
            if item == *existing {
                item.set_creation(existing.creation().cloned());
                item.set_deletion(existing.deletion().cloned());
                return self.merge(item, stored_id(existing)?);
            }
        }

        let change_id = save_change(self.gateway, change)?;

        if let Some(existing) = &existing {
            let previous = stored_id(existing)?;
            let updated = self.mark_deleted::<T>(previous, change_id)?;
            if updated != 1 {
                return Err(DedupError::consistency("supersede", 1, updated as i64));
            }
            debug!("Superseded {} #{} by change #{}", T::TABLE, previous, change_id);
        }

        item.set_creation(Some(change.clone()));
        item.set_deletion(None);

        let mut columns: Vec<&str> = T::COLUMNS.to_vec();
        columns.push("creation");
        let mut values = item.to_row();
        values.push(SqlValue::Integer(change_id));

        let id = self.gateway.insert(T::TABLE, &columns, &values)?;
        item.set_id(Some(id));
        debug!("Inserted {} #{} (change #{})", T::TABLE, id, change_id);
        Ok(item)
    }

    /// Soft delete. A no-op for items that are already deleted.
    ///
    /// The stored row decides: if it was deleted through another handle (e.g. superseded),
    /// the item picks up that deletion and `change` is not stored.
    pub fn delete<T: Evolvable>(&self, item: &mut T, change: &mut Change) -> Result<()> {
        if item.deletion().is_some() {
            return Ok(());
        }
        let id = item
            .id()
            .ok_or_else(|| DedupError::not_persisted(format!("{} was never saved", T::TABLE)))?;

        let row = self
            .gateway
            .get(T::TABLE, &["deletion"], id)?
            .ok_or_else(|| DedupError::not_persisted(format!("{} #{} does not exist", T::TABLE, id)))?;

        if let Some(deleted_by) = column::<Option<Id>>(&row, 0)? {
            let stored = get_change(self.gateway, deleted_by)?.ok_or_else(|| DedupError::Decode {
                message: format!("{} #{} refers to missing change #{}", T::TABLE, id, deleted_by),
            })?;
            item.set_deletion(Some(stored));
            debug!("{} #{} was already deleted by change #{}", T::TABLE, id, deleted_by);
            return Ok(());
        }

        let change_id = save_change(self.gateway, change)?;
        let updated = self.mark_deleted::<T>(id, change_id)?;
        if updated != 1 {
            return Err(DedupError::consistency("soft delete", 1, updated as i64));
        }
        item.set_deletion(Some(change.clone()));
        debug!("Deleted {} #{} (change #{})", T::TABLE, id, change_id);
        Ok(())
    }

    /// Live (non-deleted) items in id order.
    pub fn list_all<T: Evolvable>(&self) -> Result<Vec<T>> {
        self.find_live::<T>(None)
    }

    /// Number of live items.
    pub fn count_all<T: Evolvable>(&self) -> Result<i64> {
        let count = self.gateway.query_i64(
            &format!("SELECT COUNT(*) FROM {} WHERE deletion IS NULL", T::TABLE),
            &[],
        )?;
        Ok(count.unwrap_or(0))
    }

    fn mark_deleted<T: Evolvable>(&self, id: Id, change_id: Id) -> Result<usize> {
        // Deletion is set once; an already deleted row keeps its original change
        self.gateway.execute_update(
            &format!(
                "UPDATE {} SET deletion = ?1 WHERE id = ?2 AND deletion IS NULL",
                T::TABLE
            ),
            &[SqlValue::Integer(change_id), SqlValue::Integer(id)],
        )
    }

    fn find_live<T: Evolvable>(&self, criteria: Option<&Criteria>) -> Result<Vec<T>> {
        let (where_sql, params) = criteria.map(|c| c.to_sql(1)).unwrap_or_default();
        let filter = if where_sql.is_empty() {
            String::new()
        } else {
            format!(" AND {}", where_sql)
        };
        let sql = format!(
            "SELECT id, creation, deletion, {} FROM {} WHERE deletion IS NULL{} ORDER BY id",
            T::COLUMNS.join(", "),
            T::TABLE,
            filter
        );

        let mut rows: Vec<(T, Option<Id>, Option<Id>)> = Vec::new();
        self.gateway.execute_query(&sql, &params, &mut |row| {
            let item = T::from_row(column(row, 0)?, &row[3..])?;
            rows.push((item, column(row, 1)?, column(row, 2)?));
            Ok(())
        })?;

        let mut changes: HashMap<Id, Option<Change>> = HashMap::new();
        let mut items = Vec::with_capacity(rows.len());
        for (mut item, creation, deletion) in rows {
            item.set_creation(self.cached_change(&mut changes, creation)?);
            item.set_deletion(self.cached_change(&mut changes, deletion)?);
            items.push(item);
        }
        Ok(items)
    }

    fn cached_change(
        &self,
        cache: &mut HashMap<Id, Option<Change>>,
        id: Option<Id>,
    ) -> Result<Option<Change>> {
        let id = match id {
            Some(id) => id,
            None => return Ok(None),
        };
        if let Some(change) = cache.get(&id) {
            return Ok(change.clone());
        }
        let change = get_change(self.gateway, id)?;
        cache.insert(id, change.clone());
        Ok(change)
    }
}

fn reject_versioned<T: Persistable>() -> Result<()> {
    if T::VERSIONED {
        return Err(DedupError::VersionedEntity {
            entity: T::entity_name().to_string(),
        });
    }
    Ok(())
}

fn stored_id<T: Persistable>(item: &T) -> Result<Id> {
    item.id()
        .ok_or_else(|| DedupError::not_persisted(format!("{} row loaded without id", T::TABLE)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::{
        Curation, ProteinAccnum, ProteinAccnumSet, ProteinSequence, ProteinSequenceList,
    };
    use crate::gateway::SqliteGateway;

    fn test_gateway() -> SqliteGateway {
        let gateway = SqliteGateway::open_in_memory().unwrap();
        setup_database(gateway.connection()).unwrap();
        gateway
    }

    fn by_sequence(seq: &ProteinSequence) -> Criteria {
        Criteria::new().eq("sequence", seq.sequence.clone())
    }

    fn by_short_name(curation: &Curation) -> Criteria {
        Criteria::new().eq("short_name", curation.short_name.clone())
    }

    // ------------------------------------------------------------------------
    // save / save_lax_equality
    // ------------------------------------------------------------------------

    #[test]
    fn test_equal_values_share_one_row() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let first = ProteinSequence::new("PEPTIDEK");
        let first = resolver.save(first.clone(), &by_sequence(&first), false).unwrap();

        let second = ProteinSequence::new("PEPTIDEK").with_mass(927.5);
        let second = resolver.save(second.clone(), &by_sequence(&second), false).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(resolver.row_count::<ProteinSequence>().unwrap(), 1);

        // Auxiliary field merged into the stored row
        let stored: ProteinSequence = resolver.get(first.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.mass, Some(927.5));
    }

    #[test]
    fn test_create_new_rejects_existing_value() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let seq = ProteinSequence::new("PEPTIDEK");
        resolver.save(seq.clone(), &by_sequence(&seq), true).unwrap();

        let result = resolver.save(seq.clone(), &by_sequence(&seq), true);
        assert!(matches!(result, Err(DedupError::DuplicateValue { .. })));
        assert_eq!(resolver.row_count::<ProteinSequence>().unwrap(), 1);
    }

    #[test]
    fn test_weak_predicate_is_broken_equality() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let stored = ProteinSequence::new("PEPTIDEK").with_mass(900.0);
        resolver.save(stored.clone(), &by_sequence(&stored), false).unwrap();

        // Mass alone does not define equality
        let other = ProteinSequence::new("PEPTIDER").with_mass(900.0);
        let result = resolver.save(other, &Criteria::new().double_eq("mass", 900.0, 0.01), false);

        assert!(matches!(result, Err(DedupError::BrokenEquality { .. })));
        assert_eq!(resolver.row_count::<ProteinSequence>().unwrap(), 1);
    }

    #[test]
    fn test_lax_equality_picks_the_equal_candidate() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        for (sequence, mass) in [("AAAK", 500.1), ("CCCK", 500.2), ("DDDK", 500.3)] {
            let seq = ProteinSequence::new(sequence).with_mass(mass);
            resolver.save(seq.clone(), &by_sequence(&seq), false).unwrap();
        }

        let near_500 = Criteria::new().double_eq("mass", 500.2, 0.5);

        let ccck = resolver
            .save_lax_equality(ProteinSequence::new("CCCK").with_mass(500.2), &near_500, false)
            .unwrap();
        assert_eq!(ccck.id, Some(2));

        let eeek = resolver
            .save_lax_equality(ProteinSequence::new("EEEK").with_mass(500.2), &near_500, false)
            .unwrap();
        assert_eq!(eeek.id, Some(4));
        assert_eq!(resolver.row_count::<ProteinSequence>().unwrap(), 4);

        let again = resolver.save_lax_equality(ProteinSequence::new("DDDK"), &near_500, true);
        assert!(matches!(again, Err(DedupError::DuplicateValue { .. })));
    }

    // ------------------------------------------------------------------------
    // hashed collections
    // ------------------------------------------------------------------------

    fn list_of(ids: &[Id]) -> HashedCollection<ProteinSequenceList> {
        HashedCollection::from_members(
            ids.iter()
                .map(|id| ProteinSequence::new(&format!("SEQ{}", id)).with_id(*id))
                .collect(),
        )
    }

    #[test]
    fn test_hashed_collection_reused_regardless_of_order() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let mut first = list_of(&[3, 1, 2]);
        let mut second = list_of(&[2, 3, 1]);
        let id1 = resolver.update_hashed_collection(&mut first).unwrap();
        let id2 = resolver.update_hashed_collection(&mut second).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(second.id, Some(id1));
        assert_eq!(crate::db::row_count(&gateway, "protein_sequence_list").unwrap(), 1);
    }

    #[test]
    fn test_hash_collision_falls_through_to_insert() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        // 31*1 + 40 == 31*2 + 9
        let mut a = list_of(&[1, 40]);
        let mut b = list_of(&[9, 2]);
        let id_a = resolver.update_hashed_collection(&mut a).unwrap();
        let id_b = resolver.update_hashed_collection(&mut b).unwrap();

        assert_eq!(a.hash(), b.hash());
        assert_ne!(id_a, id_b);

        let mut c = list_of(&[2, 9]);
        assert_eq!(resolver.update_hashed_collection(&mut c).unwrap(), id_b);
    }

    #[test]
    fn test_unsaved_member_cannot_be_hashed() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let mut list: HashedCollection<ProteinSequenceList> =
            HashedCollection::from_members(vec![ProteinSequence::new("NEVERSAVED")]);
        let result = resolver.update_hashed_collection(&mut list);
        assert!(matches!(result, Err(DedupError::NotPersisted { .. })));
    }

    #[test]
    fn test_load_hashed_collection_keeps_order() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let mut list: HashedCollection<ProteinSequenceList> = HashedCollection::new();
        for sequence in ["KKK", "AAA", "MMM"] {
            let seq = ProteinSequence::new(sequence);
            list.add(resolver.save(seq.clone(), &by_sequence(&seq), false).unwrap());
        }
        let id = resolver.update_hashed_collection(&mut list).unwrap();

        let loaded = resolver
            .get_hashed_collection::<ProteinSequenceList>(id)
            .unwrap()
            .unwrap();
        let names: Vec<&str> = loaded.members().iter().map(|m| m.sequence.as_str()).collect();
        assert_eq!(names, vec!["KKK", "AAA", "MMM"]);
        assert_eq!(loaded.hash(), list.hash());
        assert_eq!(loaded, list);

        assert!(resolver
            .get_hashed_collection::<ProteinSequenceList>(id + 1)
            .unwrap()
            .is_none());
    }

    // ------------------------------------------------------------------------
    // evolvable entities
    // ------------------------------------------------------------------------

    #[test]
    fn test_evolvable_resave_keeps_creation() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let curation = Curation::new("SPROT", "Swiss-Prot 2024_01");
        let mut change = Change::new("add Swiss-Prot");
        let saved = resolver
            .save_evolvable(curation.clone(), &mut change, &by_short_name(&curation), false)
            .unwrap();

        let mut edited = Curation::new("SPROT", "Swiss-Prot 2024_01");
        edited.set_notes(Some("reviewed".to_string())).unwrap();
        let mut second_change = Change::new("edit notes");
        let resaved = resolver
            .save_evolvable(edited, &mut second_change, &by_short_name(&curation), false)
            .unwrap();

        assert_eq!(resaved.id, saved.id);
        assert_eq!(resaved.creation().and_then(|c| c.id), change.id);
        // Nothing was created or superseded, so the second change was never stored
        assert!(second_change.id.is_none());
        assert_eq!(crate::db::row_count(&gateway, "change_audit").unwrap(), 1);

        let listed: Vec<Curation> = resolver.list_all().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].notes(), Some("reviewed"));
        assert_eq!(listed[0].creation().map(|c| c.reason.as_str()), Some("add Swiss-Prot"));
    }

    #[test]
    fn test_evolvable_new_version_supersedes_old() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let old = Curation::new("SPROT", "Swiss-Prot 2024_01");
        let old = resolver
            .save_evolvable(old.clone(), &mut Change::new("initial"), &by_short_name(&old), false)
            .unwrap();

        let new = Curation::new("SPROT", "Swiss-Prot 2024_02");
        let new = resolver
            .save_evolvable(new.clone(), &mut Change::new("update"), &by_short_name(&new), false)
            .unwrap();

        assert_ne!(old.id, new.id);
        assert_eq!(resolver.count_all::<Curation>().unwrap(), 1);
        assert_eq!(resolver.row_count::<Curation>().unwrap(), 2);

        let live: Vec<Curation> = resolver.list_all().unwrap();
        assert_eq!(live[0].title, "Swiss-Prot 2024_02");
    }

    #[test]
    fn test_evolvable_create_new_duplicate() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let curation = Curation::new("SPROT", "Swiss-Prot 2024_01");
        resolver
            .save_evolvable(curation.clone(), &mut Change::new("a"), &by_short_name(&curation), true)
            .unwrap();
        let result = resolver.save_evolvable(
            curation.clone(),
            &mut Change::new("b"),
            &by_short_name(&curation),
            true,
        );
        assert!(matches!(result, Err(DedupError::DuplicateValue { .. })));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let curation = Curation::new("NCBI", "NCBI nr");
        let mut curation = resolver
            .save_evolvable(curation.clone(), &mut Change::new("add"), &by_short_name(&curation), false)
            .unwrap();

        resolver.delete(&mut curation, &mut Change::new("retire")).unwrap();
        assert_eq!(curation.lifecycle(), crate::entities::Lifecycle::Deleted);
        let changes_after_first = crate::db::row_count(&gateway, "change_audit").unwrap();

        let mut second = Change::new("retire again");
        resolver.delete(&mut curation, &mut second).unwrap();

        assert!(second.id.is_none());
        assert_eq!(
            crate::db::row_count(&gateway, "change_audit").unwrap(),
            changes_after_first
        );
        assert_eq!(curation.deletion().map(|c| c.reason.as_str()), Some("retire"));
        assert_eq!(resolver.count_all::<Curation>().unwrap(), 0);
    }

    #[test]
    fn test_delete_unsaved_fails() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let mut curation = Curation::new("NCBI", "NCBI nr");
        let result = resolver.delete(&mut curation, &mut Change::new("retire"));
        assert!(matches!(result, Err(DedupError::NotPersisted { .. })));
        assert_eq!(crate::db::row_count(&gateway, "change_audit").unwrap(), 0);
    }

    #[test]
    fn test_deleted_item_cannot_be_saved() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let mut curation = Curation::new("NCBI", "NCBI nr");
        curation.set_deletion(Some(Change::new("gone")));
        let result = resolver.save_evolvable(
            curation.clone(),
            &mut Change::new("resurrect"),
            &by_short_name(&curation),
            false,
        );
        assert!(matches!(result, Err(DedupError::AlreadyDeleted { .. })));
    }

    #[test]
    fn test_deleted_row_is_not_reused() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let curation = Curation::new("NCBI", "NCBI nr");
        let mut first = resolver
            .save_evolvable(curation.clone(), &mut Change::new("add"), &by_short_name(&curation), false)
            .unwrap();
        resolver.delete(&mut first, &mut Change::new("retire")).unwrap();

        let mut readd = Change::new("re-add");
        let second = resolver
            .save_evolvable(curation.clone(), &mut readd, &by_short_name(&curation), false)
            .unwrap();

        assert_ne!(second.id, first.id);
        assert_eq!(second.creation().and_then(|c| c.id), readd.id);
        assert_eq!(second.lifecycle(), crate::entities::Lifecycle::Active);
        assert_eq!(resolver.count_all::<Curation>().unwrap(), 1);
        assert_eq!(resolver.row_count::<Curation>().unwrap(), 2);

        // The old row stays deleted by its original change
        let deleted_by: Option<Id> = gateway
            .connection()
            .query_row(
                "SELECT deletion FROM curation WHERE id = ?1",
                [first.id.unwrap()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(deleted_by, first.deletion().and_then(|c| c.id));
    }

    #[test]
    fn test_delete_through_stale_handle_adopts_stored_deletion() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let v1 = Curation::new("SPROT", "Swiss-Prot 2024_01");
        let mut stale = resolver
            .save_evolvable(v1.clone(), &mut Change::new("initial"), &by_short_name(&v1), false)
            .unwrap();

        // v2 supersedes v1 in the store, the v1 handle does not know
        let v2 = Curation::new("SPROT", "Swiss-Prot 2024_02");
        let mut update = Change::new("update");
        resolver
            .save_evolvable(v2.clone(), &mut update, &by_short_name(&v2), false)
            .unwrap();
        let changes_before = crate::db::row_count(&gateway, "change_audit").unwrap();

        let mut retire = Change::new("retire");
        resolver.delete(&mut stale, &mut retire).unwrap();

        assert!(retire.id.is_none());
        assert_eq!(
            crate::db::row_count(&gateway, "change_audit").unwrap(),
            changes_before
        );
        assert_eq!(stale.deletion().and_then(|c| c.id), update.id);
        assert_eq!(stale.deletion().map(|c| c.reason.as_str()), Some("update"));
        assert_eq!(resolver.count_all::<Curation>().unwrap(), 1);
    }

    #[test]
    fn test_plain_save_rejects_versioned_entity() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let curation = Curation::new("SPROT", "Swiss-Prot 2024_01");
        let result = resolver.save(curation.clone(), &by_short_name(&curation), false);
        assert!(matches!(result, Err(DedupError::VersionedEntity { .. })));

        let result = resolver.save_lax_equality(curation.clone(), &by_short_name(&curation), false);
        assert!(matches!(result, Err(DedupError::VersionedEntity { .. })));
        assert_eq!(resolver.row_count::<Curation>().unwrap(), 0);
    }

    #[test]
    fn test_set_stores_repeated_member_once() {
        let gateway = test_gateway();
        let resolver = EqualityResolver::new(&gateway);

        let mut saved = Vec::new();
        for accession in ["P00001", "P00002"] {
            let accnum = ProteinAccnum::new(accession);
            let criteria = Criteria::new().eq("accnum", accnum.accnum.clone());
            saved.push(resolver.save(accnum, &criteria, false).unwrap());
        }

        let mut repeated: HashedCollection<ProteinAccnumSet> = HashedCollection::from_members(vec![
            saved[0].clone(),
            saved[1].clone(),
            saved[0].clone(),
        ]);
        let id = resolver.update_hashed_collection(&mut repeated).unwrap();
        assert_eq!(
            crate::db::row_count(&gateway, "protein_accnum_set_member").unwrap(),
            2
        );

        let mut plain: HashedCollection<ProteinAccnumSet> =
            HashedCollection::from_members(vec![saved[1].clone(), saved[0].clone()]);
        assert_eq!(resolver.update_hashed_collection(&mut plain).unwrap(), id);

        let loaded = resolver
            .get_hashed_collection::<ProteinAccnumSet>(id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
