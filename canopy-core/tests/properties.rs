//! Command Algebra Property Tests
//!
//! Runs arbitrary command sequences against the pure `apply` function and
//! checks that:
//!
//! - every produced revision is structurally valid (no cycles, no dangling
//!   children, parent links agree)
//! - a rejected command leaves the revision untouched
//! - a transaction is applied completely or not at all
//! - put-if-absent never replaces an existing entry

use proptest::prelude::*;
use serde_json::json;

use canopy_core::tree::{apply, apply_all, Command, Id, ListPosition, TreeRevision};

/// A command shape whose node references are resolved against the live
/// revision when it is applied.
#[derive(Debug, Clone)]
enum Op {
    Insert { parent: usize, value: i64, first: bool },
    Put { parent: usize, key: u8, value: i64 },
    PutIfAbsent { parent: usize, key: u8, value: i64 },
    Set { node: usize, value: i64 },
    AdoptAt { parent: usize, child: usize },
    Remove { node: usize },
    Clear { node: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<usize>(), any::<i64>(), any::<bool>())
            .prop_map(|(parent, value, first)| Op::Insert { parent, value, first }),
        (any::<usize>(), 0u8..4, any::<i64>()).prop_map(|(parent, key, value)| Op::Put { parent, key, value }),
        (any::<usize>(), 0u8..4, any::<i64>())
            .prop_map(|(parent, key, value)| Op::PutIfAbsent { parent, key, value }),
        (any::<usize>(), any::<i64>()).prop_map(|(node, value)| Op::Set { node, value }),
        (any::<usize>(), any::<usize>()).prop_map(|(parent, child)| Op::AdoptAt { parent, child }),
        any::<usize>().prop_map(|node| Op::Remove { node }),
        any::<usize>().prop_map(|node| Op::Clear { node }),
    ]
}

/// Data node ids in a stable order.
fn data_ids(revision: &TreeRevision) -> Vec<Id> {
    let mut ids: Vec<Id> = revision
        .iter()
        .filter(|(_, node)| node.as_data().is_some())
        .map(|(id, _)| id)
        .collect();
    ids.sort();
    ids
}

fn to_command(revision: &TreeRevision, op: &Op) -> Command {
    let ids = data_ids(revision);
    let pick = |index: usize| ids[index % ids.len()];

    match *op {
        Op::Insert { parent, value, first } => {
            let position = if first { ListPosition::first() } else { ListPosition::last() };
            Command::insert(pick(parent), Some(json!(value)), position)
        }
        Op::Put { parent, key, value } => Command::put(pick(parent), format!("k{key}"), Some(json!(value))),
        Op::PutIfAbsent { parent, key, value } => {
            Command::put_if_absent(pick(parent), format!("k{key}"), Some(json!(value)))
        }
        Op::Set { node, value } => Command::set(pick(node), Some(json!(value))),
        Op::AdoptAt { parent, child } => Command::adopt_at(pick(parent), pick(child), ListPosition::last()),
        Op::Remove { node } => Command::remove(pick(node), None),
        Op::Clear { node } => Command::clear(pick(node)),
    }
}

proptest! {
    /// Test that no command sequence can produce an invalid tree.
    #[test]
    fn revisions_stay_valid(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut revision = TreeRevision::new();

        for op in &ops {
            let command = to_command(&revision, op);
            let applied = apply(&revision, &command);

            prop_assert!(applied.revision.validate().is_ok(), "{:?} broke the tree", command);
            if !applied.result.is_accepted() {
                prop_assert_eq!(&applied.revision, &revision);
            }
            revision = applied.revision;
        }
    }

    /// Test that a transaction either applies every command or none.
    #[test]
    fn transactions_are_atomic(
        setup in prop::collection::vec(arb_op(), 0..15),
        batch in prop::collection::vec(arb_op(), 1..8),
    ) {
        let mut base = TreeRevision::new();
        for op in &setup {
            base = apply(&base, &to_command(&base, op)).revision;
        }

        let mut scratch = base.clone();
        let mut commands = Vec::new();
        for op in &batch {
            let command = to_command(&scratch, op);
            scratch = apply(&scratch, &command).revision;
            commands.push(command);
        }

        let (sequential, results) = apply_all(&base, &commands);
        let applied = apply(&base, &Command::transaction(commands));

        if results.iter().all(|r| r.is_accepted()) {
            prop_assert!(applied.result.is_accepted());
            prop_assert_eq!(applied.revision, sequential);
        } else {
            prop_assert!(!applied.result.is_accepted());
            prop_assert_eq!(applied.revision, base);
        }
    }

    /// Test that put-if-absent keeps whichever value got there first.
    #[test]
    fn put_if_absent_keeps_first_value(values in prop::collection::vec(any::<i64>(), 1..6)) {
        let mut revision = TreeRevision::new();
        for value in &values {
            let command = Command::put_if_absent(Id::ZERO, "key", Some(json!(value)));
            let applied = apply(&revision, &command);
            prop_assert!(applied.result.is_accepted());
            revision = applied.revision;
        }

        let root = revision.data(Id::ZERO).unwrap();
        prop_assert_eq!(root.map_children().len(), 1);
        let child = root.map_children()["key"];
        prop_assert_eq!(revision.data(child).unwrap().value(), Some(&json!(values[0])));
    }

    /// Test that a node can never be moved below itself.
    #[test]
    fn adopting_into_own_subtree_is_rejected(depth in 1usize..6) {
        let mut revision = TreeRevision::new();
        let mut chain = vec![Id::ZERO];
        for level in 0..depth {
            let command = Command::insert(chain[level], Some(json!(level)), ListPosition::last());
            chain.push(command.id);
            revision = apply(&revision, &command).revision;
        }

        let top = chain[1];
        let bottom = chain[depth];
        let applied = apply(&revision, &Command::adopt_at(bottom, top, ListPosition::last()));

        prop_assert!(!applied.result.is_accepted());
        prop_assert_eq!(applied.revision, revision);
    }
}
