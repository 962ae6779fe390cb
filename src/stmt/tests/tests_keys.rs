use crate::stmt::*;

fn tuple(fields: &[&[u8]]) -> Tuple {
    Tuple::new(fields.iter().map(|f| f.to_vec()).collect())
}

/// # Scenario
/// A key definition extracts its parts in definition order, so a secondary
/// index can sort the same tuple differently from the primary.
#[test]
fn extract_follows_part_order() {
    let t = tuple(&[b"id", b"name", b"city"]);
    let primary = KeyDef::new(vec![0]);
    let by_city = KeyDef::new(vec![2, 0]);

    assert_eq!(primary.extract(&t), Key(vec![b"id".to_vec()]));
    assert_eq!(
        by_city.extract(&t),
        Key(vec![b"city".to_vec(), b"id".to_vec()])
    );
}

/// # Scenario
/// Comparison is part-wise; earlier parts dominate.
#[test]
fn compare_is_part_wise() {
    let def = KeyDef::new(vec![1, 0]);
    let a = tuple(&[b"2", b"a"]);
    let b = tuple(&[b"1", b"b"]);
    // Part 1: "a" < "b" decides before part 0 is consulted.
    assert_eq!(def.compare(&a, &b), std::cmp::Ordering::Less);

    let c = tuple(&[b"1", b"a"]);
    assert_eq!(def.compare(&a, &c), std::cmp::Ordering::Greater);
    assert_eq!(def.compare(&c, &c.clone()), std::cmp::Ordering::Equal);
}

/// # Scenario
/// `merge` appends the primary's parts without duplicating shared ones —
/// the comparison definition a secondary index uses for uniqueness.
#[test]
fn merge_appends_missing_primary_parts() {
    let secondary = KeyDef::new(vec![2]);
    let primary = KeyDef::new(vec![0, 2]);
    assert_eq!(secondary.merge(&primary).parts, vec![2, 0]);
}

/// # Scenario
/// A surrogate delete keeps exactly the key fields of the old statement
/// and blanks the rest, stamped with the shadowing LSN.
#[test]
fn surrogate_delete_keeps_key_fields() {
    let def = KeyDef::new(vec![0]);
    let old = Statement::replace(vec![b"pk".to_vec(), b"payload".to_vec()], 7);
    let surrogate = def.surrogate_delete(&old, 42);

    assert_eq!(surrogate.op, OpType::Delete);
    assert_eq!(surrogate.lsn, 42);
    assert_eq!(surrogate.tuple.fields, vec![b"pk".to_vec(), Vec::new()]);
}

/// # Scenario
/// Statements round-trip through the wire format.
#[test]
fn statement_round_trip() {
    use crate::encoding::{decode_from_slice, encode_to_vec};

    for stmt in [
        Statement::replace(vec![b"k".to_vec(), b"v".to_vec()], 9),
        Statement::delete(vec![b"k".to_vec()], 10),
    ] {
        let bytes = encode_to_vec(&stmt).unwrap();
        let (decoded, n) = decode_from_slice::<Statement>(&bytes).unwrap();
        assert_eq!(decoded, stmt);
        assert_eq!(n, bytes.len());
    }
}

/// # Scenario
/// Half-open interval membership treats `None` as unbounded, the begin
/// bound as inclusive, and the end bound as exclusive.
#[test]
fn interval_membership() {
    let k = |s: &[u8]| Key(vec![s.to_vec()]);
    let b = k(b"b");
    let d = k(b"d");

    assert!(key_in_interval(&k(b"b"), Some(&b), Some(&d)));
    assert!(key_in_interval(&k(b"c"), Some(&b), Some(&d)));
    assert!(!key_in_interval(&k(b"d"), Some(&b), Some(&d)));
    assert!(!key_in_interval(&k(b"a"), Some(&b), None));
    assert!(key_in_interval(&k(b"zz"), Some(&b), None));
    assert!(key_in_interval(&k(b"anything"), None, None));
}

/// # Scenario
/// Interval overlap over half-open intervals, with unbounded sides.
#[test]
fn interval_overlap() {
    let k = |s: &[u8]| Key(vec![s.to_vec()]);
    let (a, b, c, d) = (k(b"a"), k(b"b"), k(b"c"), k(b"d"));

    assert!(intervals_overlap(Some(&a), Some(&c), Some(&b), Some(&d)));
    assert!(!intervals_overlap(Some(&a), Some(&b), Some(&b), Some(&d)));
    assert!(intervals_overlap(None, None, Some(&c), Some(&d)));
    assert!(intervals_overlap(Some(&a), None, Some(&c), Some(&d)));
    assert!(!intervals_overlap(None, Some(&a), Some(&b), None));
}
