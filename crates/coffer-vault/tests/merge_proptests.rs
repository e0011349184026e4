#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Property-based tests for the merge engine and the codec.
//!
//! Two copies of one database are edited by random operation sequences,
//! then merged. Verifies:
//! - `merge(m, m) == m` for any database, merged ones included
//! - every identity of either side survives unless a deletion record names it
//! - the merged tree always validates, and no history shrinks

use coffer_vault::{decode, encode, merge, Database, Entry, FormatPreferences, Group, KdfSetting, KeyMaterial};
use proptest::prelude::*;
use proptest::sample::Index;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Op {
    AddGroup(Index),
    AddEntry(Index, String),
    Edit(Index, String),
    MoveEntry(Index, Index),
    MoveGroup(Index, Index),
    Delete(Index),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<Index>().prop_map(Op::AddGroup),
        (any::<Index>(), "[a-z]{1,8}").prop_map(|(i, t)| Op::AddEntry(i, t)),
        (any::<Index>(), "[a-z]{1,8}").prop_map(|(i, t)| Op::Edit(i, t)),
        (any::<Index>(), any::<Index>()).prop_map(|(a, b)| Op::MoveEntry(a, b)),
        (any::<Index>(), any::<Index>()).prop_map(|(a, b)| Op::MoveGroup(a, b)),
        any::<Index>().prop_map(Op::Delete),
    ]
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(op_strategy(), 0..12)
}

fn apply(db: &mut Database, op: &Op) {
    let groups: Vec<Uuid> = db.groups().map(Group::uuid).collect();
    let entries: Vec<Uuid> = db.entries().map(Entry::uuid).collect();
    match op {
        Op::AddGroup(parent) => {
            db.add_group(groups[parent.index(groups.len())], Group::new("g")).unwrap();
        }
        Op::AddEntry(parent, title) => {
            let mut entry = Entry::new();
            entry.set("Title", title.as_str());
            db.add_entry(groups[parent.index(groups.len())], entry).unwrap();
        }
        Op::Edit(which, title) if !entries.is_empty() => {
            db.update_entry(entries[which.index(entries.len())], |e| {
                e.set("Title", title.as_str());
            })
            .unwrap();
        }
        Op::MoveEntry(which, to) if !entries.is_empty() => {
            db.move_entry(entries[which.index(entries.len())], groups[to.index(groups.len())])
                .unwrap();
        }
        Op::MoveGroup(which, to) => {
            // Root and cyclic targets are refused; both are fine here.
            let _ = db.move_group(groups[which.index(groups.len())], groups[to.index(groups.len())]);
        }
        Op::Delete(which) => {
            let root = db.root_id();
            let items: Vec<Uuid> = groups.iter().chain(&entries).copied().filter(|id| *id != root).collect();
            if !items.is_empty() {
                db.delete_permanently(items[which.index(items.len())]).unwrap();
            }
        }
        _ => {}
    }
}

fn build(seed: &[Op], local: &[Op], remote: &[Op]) -> (Database, Database) {
    let mut base = Database::new("prop");
    base.meta.recycle_bin_enabled = false;
    for op in seed {
        apply(&mut base, op);
    }
    let mut a = base.clone();
    let mut b = base;
    for op in local {
        apply(&mut a, op);
    }
    for op in remote {
        apply(&mut b, op);
    }
    (a, b)
}

fn identities(db: &Database) -> Vec<Uuid> {
    db.groups().map(Group::uuid).chain(db.entries().map(Entry::uuid)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Merging any database with itself returns it unchanged.
    #[test]
    fn merge_with_self_is_identity(seed in ops(), edits in ops()) {
        let (db, _) = build(&seed, &edits, &[]);
        let (merged, report) = merge(&db, &db);
        prop_assert_eq!(&merged, &db);
        prop_assert!(report.is_empty());
    }

    /// A merge result is a fixed point of merging with itself.
    #[test]
    fn merged_result_is_idempotent(seed in ops(), local in ops(), remote in ops()) {
        let (a, b) = build(&seed, &local, &remote);
        let (m, _) = merge(&a, &b);
        let (again, _) = merge(&m, &m);
        prop_assert_eq!(again, m);
    }

    /// Nothing disappears without a deletion record.
    #[test]
    fn union_is_total(seed in ops(), local in ops(), remote in ops()) {
        let (a, b) = build(&seed, &local, &remote);
        let (m, _) = merge(&a, &b);
        for id in identities(&a).into_iter().chain(identities(&b)) {
            prop_assert!(
                m.contains(id) || m.deleted_objects().deleted_at(&id).is_some(),
                "identity {} vanished", id
            );
        }
    }

    /// The merged tree validates and histories never shrink.
    #[test]
    fn merged_tree_is_consistent(seed in ops(), local in ops(), remote in ops()) {
        let (a, b) = build(&seed, &local, &remote);
        let (m, _) = merge(&a, &b);
        prop_assert!(m.validate().is_ok());
        for entry in m.entries() {
            let id = entry.uuid();
            let longest = [a.entry(id), b.entry(id)]
                .into_iter()
                .flatten()
                .map(|e| e.history().len())
                .max()
                .unwrap_or(0);
            prop_assert!(entry.history().len() >= longest);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Any edited database survives encode / decode.
    #[test]
    fn codec_roundtrip(seed in ops()) {
        let (db, _) = build(&seed, &[], &[]);
        let key = KeyMaterial::from_password("prop");
        let prefs = FormatPreferences {
            kdf: KdfSetting::AesKdf { rounds: 4 },
            ..FormatPreferences::default()
        };
        let bytes = encode(&db, &key, &prefs).expect("encode should succeed");
        prop_assert_eq!(decode(&bytes, &key).expect("decode should succeed"), db);
    }
}
