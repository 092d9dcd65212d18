//! Vector clock ordering and per-system local clocks.

use confluence_core::clock::{ClockOrdering, LocalClock, VectorClock};

fn vc(entries: &[(&str, u64)]) -> VectorClock {
    VectorClock::from_entries(entries.iter().map(|(k, v)| (k.to_string(), *v)))
}

#[test]
fn test_ordering_cases() {
    let a = vc(&[("legacy", 1), ("backend", 2)]);
    let b = vc(&[("legacy", 2), ("backend", 2)]);
    let c = vc(&[("legacy", 0), ("backend", 3)]);

    assert_eq!(a.compare(&b), ClockOrdering::Before);
    assert_eq!(b.compare(&a), ClockOrdering::After);
    assert_eq!(a.compare(&a.clone()), ClockOrdering::Equal);
    assert_eq!(b.compare(&c), ClockOrdering::Concurrent);
    assert!(a.happens_before(&b));
    assert!(b.concurrent_with(&c));
}

#[test]
fn test_missing_entries_read_as_zero() {
    let a = vc(&[("frontend", 1)]);
    let b = vc(&[("frontend", 1), ("legacy", 1)]);

    assert_eq!(a.get("legacy"), 0);
    assert_eq!(a.compare(&b), ClockOrdering::Before);
    assert_eq!(VectorClock::new().compare(&vc(&[("legacy", 0)])), ClockOrdering::Equal);
}

#[test]
fn test_merge_is_commutative_and_idempotent() {
    let a = vc(&[("legacy", 4), ("backend", 1)]);
    let b = vc(&[("legacy", 2), ("frontend", 3)]);

    let ab = a.merged(&b);
    assert_eq!(ab, b.merged(&a));
    assert_eq!(ab.merged(&ab), ab);
    assert_eq!(ab, vc(&[("legacy", 4), ("backend", 1), ("frontend", 3)]));
    assert!(a.happens_before(&ab) && b.happens_before(&ab));
}

#[test]
fn test_two_systems_editing_without_sync_are_concurrent() {
    let base = vc(&[("legacy", 1)]);
    let mut legacy = LocalClock::resume("legacy", base.clone());
    let mut backend = LocalClock::resume("backend", base);

    let l = legacy.tick();
    let b = backend.tick();
    assert_eq!(l.compare(&b), ClockOrdering::Concurrent);

    // After backend observes legacy's write, its next write dominates both.
    backend.observe(&l);
    let after = backend.tick();
    assert!(l.happens_before(&after));
    assert!(b.happens_before(&after));
}

#[test]
fn test_reverse_ordering() {
    assert_eq!(ClockOrdering::Before.reverse(), ClockOrdering::After);
    assert_eq!(ClockOrdering::Concurrent.reverse(), ClockOrdering::Concurrent);
    assert_eq!(ClockOrdering::Equal.reverse(), ClockOrdering::Equal);
}
