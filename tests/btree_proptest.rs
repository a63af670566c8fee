use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use rustql_btree::{AutoVacuum, Btree, BtreeConfig, BtreePayload, TreeKind};

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, usize),
    Delete(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0i64..300, 0usize..1400).prop_map(|(rowid, len)| Op::Insert(rowid, len)),
        1 => (0i64..300).prop_map(Op::Delete),
    ]
}

fn fill(rowid: i64, len: usize) -> Vec<u8> {
    vec![(rowid % 251) as u8; len]
}

fn vacuum_mode() -> impl Strategy<Value = AutoVacuum> {
    prop_oneof![
        Just(AutoVacuum::None),
        Just(AutoVacuum::Full),
        Just(AutoVacuum::Incremental),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_table_matches_model(ops in prop::collection::vec(op_strategy(), 1..250), mode in vacuum_mode()) {
        let config = BtreeConfig::default().with_page_size(512).with_auto_vacuum(mode);
        let bt = Btree::open_memory(config).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(rowid, len) => {
                    cursor.insert(&BtreePayload::row(rowid, fill(rowid, len))).unwrap();
                    model.insert(rowid, fill(rowid, len));
                }
                Op::Delete(rowid) => {
                    let found = cursor.seek_rowid(rowid).unwrap();
                    prop_assert_eq!(found, model.contains_key(&rowid));
                    if found {
                        cursor.delete().unwrap();
                        model.remove(&rowid);
                    }
                }
            }
        }
        bt.commit().unwrap();

        let rows = cursor.iter().collect::<rustql_btree::Result<Vec<_>>>().unwrap();
        let expected: Vec<(i64, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(rows, expected);

        let report = bt.integrity_check(&[root], 0).unwrap();
        prop_assert!(report.is_ok, "{:?}", report.errors);
    }

    #[test]
    fn test_index_keys_stay_sorted(keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..120), 1..200)) {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let index = bt.create_table(TreeKind::Index).unwrap();
        let mut cursor = bt.cursor(index, true).unwrap();
        let mut model = BTreeSet::new();
        for key in &keys {
            cursor.insert(&BtreePayload::index_key(key.clone())).unwrap();
            model.insert(key.clone());
        }
        // Drop every other distinct key
        for key in model.iter().step_by(2) {
            prop_assert!(cursor.seek_key(key).unwrap());
            cursor.delete().unwrap();
        }
        let kept: Vec<Vec<u8>> = model.iter().skip(1).step_by(2).cloned().collect();

        let mut found = Vec::new();
        let mut more = cursor.first().unwrap();
        while more {
            found.push(cursor.key().unwrap());
            more = cursor.next().unwrap();
        }
        prop_assert_eq!(found, kept);

        let report = bt.integrity_check(&[index], 0).unwrap();
        prop_assert!(report.is_ok, "{:?}", report.errors);
    }
}
