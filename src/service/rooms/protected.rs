use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use ruma::{OwnedRoomId, OwnedUserId};

use crate::utils::sha256;

/// Cached, per-room state an evaluator tracks while the room is protected.
#[derive(Clone, Default)]
pub struct ProtectedRoomState {
    pub name: Option<String>,
    pub cached_acl_deny: Vec<String>,
    pub apply_acl: bool,
}

/// Process-wide arbitration: a room may be protected by at most one
/// evaluator, and must not coincide with any management room.
#[derive(Default)]
pub struct ProtectedRoomRegistry {
    owners: RwLock<HashMap<OwnedRoomId, OwnedRoomId>>,
    management_rooms: RwLock<HashSet<OwnedRoomId>>,
}

impl ProtectedRoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_management_room(&self, room_id: OwnedRoomId) {
        self.management_rooms.write().unwrap().insert(room_id);
    }

    pub fn is_management_room(&self, room_id: &OwnedRoomId) -> bool {
        self.management_rooms.read().unwrap().contains(room_id)
    }

    /// `claim=true` attempts to become the owner of `room_id`; returns the
    /// current owner if someone else already holds it (the caller must back
    /// off). `claim=false` releases ownership if `evaluator` currently holds
    /// it. Holds the write lock across the whole check-and-set.
    pub fn claim_protected(
        &self,
        room_id: &OwnedRoomId,
        evaluator: &OwnedRoomId,
        claim: bool,
    ) -> Option<OwnedRoomId> {
        if self.management_rooms.read().unwrap().contains(room_id) {
            return Some(room_id.clone());
        }

        let mut owners = self.owners.write().unwrap();
        if claim {
            match owners.get(room_id) {
                Some(owner) if owner != evaluator => Some(owner.clone()),
                Some(_) => None,
                None => {
                    owners.insert(room_id.clone(), evaluator.clone());
                    None
                }
            }
        } else {
            if owners.get(room_id) == Some(evaluator) {
                owners.remove(room_id);
            }
            None
        }
    }
}

/// Per-evaluator membership tracking: which protected rooms a user is
/// currently in, and a hash index to resolve hash-only policies back to
/// concrete members. A user known to have ever been a member is retained
/// with an empty room list so late redactions still resolve.
#[derive(Default)]
pub struct MemberIndex {
    protected_room_members: HashMap<OwnedUserId, Vec<OwnedRoomId>>,
    member_hashes: HashMap<[u8; 32], OwnedUserId>,
}

impl MemberIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_membership(&mut self, user_id: &OwnedUserId, room_id: &OwnedRoomId) {
        let rooms = self
            .protected_room_members
            .entry(user_id.clone())
            .or_default();
        if !rooms.contains(room_id) {
            rooms.push(room_id.clone());
        }
        self.member_hashes
            .insert(sha256(user_id.as_bytes()), user_id.clone());
    }

    /// Records that a user is known (e.g. as an invite's inviter) without
    /// them being a member of any protected room yet — the coupling that
    /// lets a later rule trigger `RejectPendingInvites`.
    pub fn note_known_user(&mut self, user_id: &OwnedUserId) {
        self.protected_room_members.entry(user_id.clone()).or_default();
        self.member_hashes
            .insert(sha256(user_id.as_bytes()), user_id.clone());
    }

    pub fn note_departure(&mut self, user_id: &OwnedUserId, room_id: &OwnedRoomId) {
        if let Some(rooms) = self.protected_room_members.get_mut(user_id) {
            rooms.retain(|r| r != room_id);
        }
    }

    pub fn rooms_for(&self, user_id: &OwnedUserId) -> &[OwnedRoomId] {
        self.protected_room_members
            .get(user_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn resolve_hash(&self, hash: &[u8; 32]) -> Option<&OwnedUserId> {
        self.member_hashes.get(hash)
    }

    pub fn known_members(&self) -> impl Iterator<Item = &OwnedUserId> {
        self.protected_room_members.keys()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id};

    use super::*;

    #[test]
    fn claim_protected_arbitrates_single_owner() {
        let registry = ProtectedRoomRegistry::new();
        let room = room_id!("!r:x.example").to_owned();
        let eval_a = room_id!("!a:x.example").to_owned();
        let eval_b = room_id!("!b:x.example").to_owned();

        assert!(registry.claim_protected(&room, &eval_a, true).is_none());
        assert_eq!(
            registry.claim_protected(&room, &eval_b, true),
            Some(eval_a.clone())
        );
        registry.claim_protected(&room, &eval_a, false);
        assert!(registry.claim_protected(&room, &eval_b, true).is_none());
    }

    #[test]
    fn management_room_can_never_be_claimed() {
        let registry = ProtectedRoomRegistry::new();
        let room = room_id!("!m:x.example").to_owned();
        registry.register_management_room(room.clone());
        let eval_a = room_id!("!a:x.example").to_owned();
        assert!(registry.claim_protected(&room, &eval_a, true).is_some());
    }

    #[test]
    fn member_index_keeps_empty_entry_after_leave() {
        let mut index = MemberIndex::new();
        let user = user_id!("@u:x.example").to_owned();
        let room = room_id!("!r:x.example").to_owned();
        index.note_membership(&user, &room);
        index.note_departure(&user, &room);
        assert!(index.rooms_for(&user).is_empty());
        assert!(index.known_members().any(|u| u == &user));
    }

    #[test]
    fn resolve_hash_finds_member_by_sha256() {
        let mut index = MemberIndex::new();
        let user = user_id!("@u:x.example").to_owned();
        index.note_known_user(&user);
        let hash = sha256(user.as_bytes());
        assert_eq!(index.resolve_hash(&hash), Some(&user));
        assert_eq!(index.resolve_hash(&sha256(b"nobody")), None);
    }
}
