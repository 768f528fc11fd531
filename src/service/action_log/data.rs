use ruma::{OwnedRoomId, OwnedUserId};
use rusqlite::{params, OptionalExtension};

use crate::{db::Pool, Result};

use super::{ActionRecord, ActionType};

/// SQL-backed surface over the `taken_action` table; the service layer
/// never constructs SQL directly, mirroring the teacher's `Data` trait split.
pub trait Data: Send + Sync {
    fn put(&self, record: &ActionRecord) -> Result<()>;
    fn delete(
        &self,
        target_user: &OwnedUserId,
        in_room_id: &OwnedRoomId,
        action_type: ActionType,
    ) -> Result<()>;
    fn get(
        &self,
        target_user: &OwnedUserId,
        in_room_id: &OwnedRoomId,
        action_type: ActionType,
    ) -> Result<Option<ActionRecord>>;
    fn get_all_by_policy_list(
        &self,
        policy_room_id: &OwnedRoomId,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>>;
    fn get_all_by_rule_entity(
        &self,
        rule_entity: &str,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>>;
    fn get_all_by_target_user(
        &self,
        target_user: &OwnedUserId,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>>;
}

pub struct SqliteData {
    pool: &'static Pool,
}

impl SqliteData {
    pub fn new(pool: &'static Pool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionRecord> {
    let target_user: String = row.get(0)?;
    let in_room_id: String = row.get(1)?;
    let action_type: String = row.get(2)?;
    let source_policy_room_id: String = row.get(3)?;
    let rule_entity: String = row.get(4)?;
    let recommendation: String = row.get(5)?;
    let taken_at_ms: i64 = row.get(6)?;

    Ok(ActionRecord {
        target_user: OwnedUserId::try_from(target_user).unwrap(),
        in_room_id: OwnedRoomId::try_from(in_room_id).unwrap(),
        action_type: ActionType::from_str(&action_type),
        source_policy_room_id: OwnedRoomId::try_from(source_policy_room_id).unwrap(),
        rule_entity,
        recommendation,
        taken_at_ms,
    })
}

impl Data for SqliteData {
    fn put(&self, record: &ActionRecord) -> Result<()> {
        self.pool.with_writer(|conn| {
            conn.execute(
                "INSERT INTO taken_action
                    (target_user, in_room_id, action_type, source_policy_room_id, rule_entity, recommendation, taken_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(target_user, in_room_id, action_type) DO UPDATE SET
                    source_policy_room_id = excluded.source_policy_room_id,
                    rule_entity = excluded.rule_entity,
                    recommendation = excluded.recommendation,
                    taken_at_ms = excluded.taken_at_ms",
                params![
                    record.target_user.as_str(),
                    record.in_room_id.as_str(),
                    record.action_type.as_str(),
                    record.source_policy_room_id.as_str(),
                    record.rule_entity,
                    record.recommendation,
                    record.taken_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    fn delete(
        &self,
        target_user: &OwnedUserId,
        in_room_id: &OwnedRoomId,
        action_type: ActionType,
    ) -> Result<()> {
        self.pool.with_writer(|conn| {
            conn.execute(
                "DELETE FROM taken_action WHERE target_user = ?1 AND in_room_id = ?2 AND action_type = ?3",
                params![target_user.as_str(), in_room_id.as_str(), action_type.as_str()],
            )?;
            Ok(())
        })
    }

    fn get(
        &self,
        target_user: &OwnedUserId,
        in_room_id: &OwnedRoomId,
        action_type: ActionType,
    ) -> Result<Option<ActionRecord>> {
        self.pool.with_reader(|conn| {
            Ok(conn
                .query_row(
                    "SELECT target_user, in_room_id, action_type, source_policy_room_id, rule_entity, recommendation, taken_at_ms
                     FROM taken_action WHERE target_user = ?1 AND in_room_id = ?2 AND action_type = ?3",
                    params![target_user.as_str(), in_room_id.as_str(), action_type.as_str()],
                    row_to_record,
                )
                .optional()?)
        })
    }

    fn get_all_by_policy_list(
        &self,
        policy_room_id: &OwnedRoomId,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>> {
        self.pool.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT target_user, in_room_id, action_type, source_policy_room_id, rule_entity, recommendation, taken_at_ms
                 FROM taken_action WHERE source_policy_room_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![policy_room_id.as_str()], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(filter_by_rooms(rows, rooms))
        })
    }

    fn get_all_by_rule_entity(
        &self,
        rule_entity: &str,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>> {
        self.pool.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT target_user, in_room_id, action_type, source_policy_room_id, rule_entity, recommendation, taken_at_ms
                 FROM taken_action WHERE rule_entity = ?1",
            )?;
            let rows = stmt
                .query_map(params![rule_entity], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(filter_by_rooms(rows, rooms))
        })
    }

    fn get_all_by_target_user(
        &self,
        target_user: &OwnedUserId,
        rooms: &[OwnedRoomId],
    ) -> Result<Vec<ActionRecord>> {
        self.pool.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT target_user, in_room_id, action_type, source_policy_room_id, rule_entity, recommendation, taken_at_ms
                 FROM taken_action WHERE target_user = ?1",
            )?;
            let rows = stmt
                .query_map(params![target_user.as_str()], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(filter_by_rooms(rows, rooms))
        })
    }
}

fn filter_by_rooms(records: Vec<ActionRecord>, rooms: &[OwnedRoomId]) -> Vec<ActionRecord> {
    if rooms.is_empty() {
        records
    } else {
        records
            .into_iter()
            .filter(|r| rooms.contains(&r.in_room_id))
            .collect()
    }
}
