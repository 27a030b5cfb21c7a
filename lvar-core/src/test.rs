use crate::{
    GCounter, GSet, LatticeRegistry, StoreError, Threshold, Value,
};
use arcstr::{literal, ArcStr};
use proptest::prelude::*;

fn reg() -> LatticeRegistry {
    LatticeRegistry::default()
}

#[test]
fn registry_classifies_tags() {
    let reg = reg();
    for t in ["gcounter", "gset", "maxu64", "orbool"] {
        assert!(reg.is_lattice(&ArcStr::from(t)));
    }
    assert!(!reg.is_lattice(&literal!("string")));
    assert!(!reg.is_lattice(&literal!("")));
}

#[test]
fn bottoms() {
    let reg = reg();
    assert_eq!(
        reg.bottom(&literal!("gcounter")).unwrap(),
        Value::Counter(GCounter::new())
    );
    assert_eq!(reg.bottom(&literal!("gset")).unwrap(), Value::Set(GSet::new()));
    assert_eq!(reg.bottom(&literal!("maxu64")).unwrap(), Value::U64(0));
    assert_eq!(reg.bottom(&literal!("orbool")).unwrap(), Value::Bool(false));
    let e = reg.bottom(&literal!("nope")).unwrap_err();
    assert_eq!(
        e.downcast::<StoreError>().unwrap(),
        StoreError::UnknownLattice(literal!("nope"))
    );
}

#[test]
fn maxu64_thresholds() {
    let reg = reg();
    let t = literal!("maxu64");
    let at5 = Threshold::AtLeast(Value::U64(5));
    let gt5 = Threshold::StrictlyGreater(Value::U64(5));
    assert!(!reg.threshold_met(&t, &Value::U64(4), &at5).unwrap());
    assert!(reg.threshold_met(&t, &Value::U64(5), &at5).unwrap());
    assert!(reg.threshold_met(&t, &Value::U64(6), &at5).unwrap());
    assert!(!reg.threshold_met(&t, &Value::U64(5), &gt5).unwrap());
    assert!(reg.threshold_met(&t, &Value::U64(6), &gt5).unwrap());
}

#[test]
fn counter_payload_mismatch() {
    let reg = reg();
    let e = reg
        .join(&literal!("gcounter"), &Value::U64(1), &Value::U64(2))
        .unwrap_err();
    assert_eq!(e.downcast::<StoreError>().unwrap(), StoreError::TypeMismatch);
}

#[test]
fn counter_increments() {
    let me = literal!("me");
    let them = literal!("them");
    let mut c = GCounter::new();
    c.incr(&me, 1);
    c.incr(&me, 2);
    c.incr(&them, 5);
    assert_eq!(c.get(&me), 3);
    assert_eq!(c.get(&them), 5);
    assert_eq!(c.total(), 8);
}

fn actor() -> impl Strategy<Value = ArcStr> {
    prop_oneof![
        Just(literal!("a")),
        Just(literal!("b")),
        Just(literal!("c"))
    ]
}

fn gcounter() -> impl Strategy<Value = Value> {
    proptest::collection::vec((actor(), 0u64..100), 0..6).prop_map(|kvs| {
        let mut c = GCounter::new();
        for (a, n) in kvs {
            c.incr(&a, n)
        }
        Value::Counter(c)
    })
}

fn gset() -> impl Strategy<Value = Value> {
    proptest::collection::btree_set(0u64..16, 0..8)
        .prop_map(|s| Value::Set(s.into_iter().map(Value::U64).collect()))
}

fn join_laws(tag: ArcStr, a: Value, b: Value, c: Value) {
    let reg = reg();
    let ab = reg.join(&tag, &a, &b).unwrap();
    let ba = reg.join(&tag, &b, &a).unwrap();
    assert_eq!(ab, ba);
    let ab_c = reg.join(&tag, &ab, &c).unwrap();
    let bc = reg.join(&tag, &b, &c).unwrap();
    let a_bc = reg.join(&tag, &a, &bc).unwrap();
    assert_eq!(ab_c, a_bc);
    assert_eq!(reg.join(&tag, &a, &a).unwrap(), a);
    let l = reg.get(&tag).unwrap();
    assert!(l.leq(&a, &ab).unwrap());
    assert!(l.leq(&b, &ab).unwrap());
    assert!(l.leq(&l.bottom(), &a).unwrap());
}

fn threshold_monotone(tag: ArcStr, a: Value, b: Value, point: Value) {
    let reg = reg();
    let at = Threshold::AtLeast(point);
    let before = reg.threshold_met(&tag, &a, &at).unwrap();
    let after =
        reg.threshold_met(&tag, &reg.join(&tag, &a, &b).unwrap(), &at).unwrap();
    // once met a threshold can never come unmet
    assert!(!before || after);
}

proptest! {
    #[test]
    fn gcounter_join_laws(a in gcounter(), b in gcounter(), c in gcounter()) {
        join_laws(literal!("gcounter"), a, b, c)
    }

    #[test]
    fn gset_join_laws(a in gset(), b in gset(), c in gset()) {
        join_laws(literal!("gset"), a, b, c)
    }

    #[test]
    fn gcounter_threshold_monotone(
        a in gcounter(),
        b in gcounter(),
        p in gcounter()
    ) {
        threshold_monotone(literal!("gcounter"), a, b, p)
    }

    #[test]
    fn gset_threshold_monotone(a in gset(), b in gset(), p in gset()) {
        threshold_monotone(literal!("gset"), a, b, p)
    }

    #[test]
    fn maxu64_join_laws(a in any::<u64>(), b in any::<u64>(), c in any::<u64>()) {
        join_laws(
            literal!("maxu64"),
            Value::U64(a),
            Value::U64(b),
            Value::U64(c),
        )
    }
}
