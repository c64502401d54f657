//! Conflict resolution for incoming updates
//!
//! Precedence is decided by (clock, quality, value) alone, never by arrival
//! order, so every receiver of the same set of updates converges.

use std::cmp::Ordering;

use super::{EntryAccess, Record};
use crate::protocol::Value;

/// Outcome of applying one update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry was overwritten
    Accepted,
    /// The current entry has equal or higher precedence; nothing changed
    RejectedStale,
}

impl ApplyOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ApplyOutcome::Accepted)
    }
}

/// Whether an update stamped `(clock, quality)` carrying `value` supersedes `current`
pub fn supersedes(current: &Record, value: &Value, clock: u64, quality: u32) -> bool {
    match clock.cmp(&current.clock) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match quality.cmp(&current.quality) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => value.tie_break(&current.value) == Ordering::Greater,
        },
    }
}

/// Apply an update to the entries, writing it only if it supersedes the
/// current record for `key`.
pub fn apply(
    entries: &mut dyn EntryAccess,
    key: &str,
    value: &Value,
    clock: u64,
    quality: u32,
) -> ApplyOutcome {
    let accept = match entries.get(key) {
        Some(current) => supersedes(current, value, clock, quality),
        None => true,
    };

    if !accept {
        return ApplyOutcome::RejectedStale;
    }

    entries.put(
        key,
        Record {
            value: value.clone(),
            clock,
            quality,
        },
    );
    ApplyOutcome::Accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Entries(HashMap<String, Record>);

    impl EntryAccess for Entries {
        fn get(&self, key: &str) -> Option<&Record> {
            self.0.get(key)
        }

        fn put(&mut self, key: &str, record: Record) {
            self.0.insert(key.to_string(), record);
        }
    }

    fn value_of(entries: &Entries, key: &str) -> Option<Value> {
        entries.get(key).map(|r| r.value.clone())
    }

    #[test]
    fn test_convergence_scenario() {
        let mut entries = Entries::default();

        let outcome = apply(&mut entries, "x", &Value::Integer(5), 1, 0);
        assert_eq!(outcome, ApplyOutcome::Accepted);
        assert_eq!(value_of(&entries, "x"), Some(Value::Integer(5)));

        // Same clock and quality: the tie-break keeps the greater value
        let outcome = apply(&mut entries, "x", &Value::Integer(3), 1, 0);
        assert_eq!(outcome, ApplyOutcome::RejectedStale);
        assert_eq!(value_of(&entries, "x"), Some(Value::Integer(5)));

        let outcome = apply(&mut entries, "x", &Value::Integer(9), 2, 0);
        assert_eq!(outcome, ApplyOutcome::Accepted);
        assert_eq!(value_of(&entries, "x"), Some(Value::Integer(9)));
    }

    #[test]
    fn test_lower_clock_never_mutates() {
        let mut entries = Entries::default();
        apply(&mut entries, "x", &Value::Integer(1), 10, 0);

        let outcome = apply(&mut entries, "x", &Value::Integer(2), 9, u32::MAX);
        assert_eq!(outcome, ApplyOutcome::RejectedStale);
        let record = entries.get("x").unwrap();
        assert_eq!(record.value, Value::Integer(1));
        assert_eq!(record.clock, 10);
        assert_eq!(record.quality, 0);
    }

    #[test]
    fn test_higher_quality_wins_at_equal_clock() {
        let mut entries = Entries::default();
        apply(&mut entries, "x", &Value::Integer(9), 4, 1);

        let outcome = apply(&mut entries, "x", &Value::Integer(1), 4, 2);
        assert_eq!(outcome, ApplyOutcome::Accepted);
        let record = entries.get("x").unwrap();
        assert_eq!(record.value, Value::Integer(1));
        assert_eq!(record.quality, 2);
    }

    #[test]
    fn test_idempotent() {
        let mut once = Entries::default();
        apply(&mut once, "x", &Value::String("a".into()), 3, 1);

        let mut twice = Entries::default();
        apply(&mut twice, "x", &Value::String("a".into()), 3, 1);
        let second = apply(&mut twice, "x", &Value::String("a".into()), 3, 1);

        assert_eq!(second, ApplyOutcome::RejectedStale);
        assert_eq!(once.get("x"), twice.get("x"));
    }

    #[test]
    fn test_order_independence() {
        let stamps = [(1u64, 0u32), (1, 1), (2, 0), (2, 5)];
        let values = [Value::Integer(3), Value::Integer(5), Value::Double(1.0)];

        let mut updates = Vec::new();
        for (clock, quality) in stamps {
            for value in &values {
                updates.push((value.clone(), clock, quality));
            }
        }

        for a in &updates {
            for b in &updates {
                let mut forward = Entries::default();
                apply(&mut forward, "k", &a.0, a.1, a.2);
                apply(&mut forward, "k", &b.0, b.1, b.2);

                let mut backward = Entries::default();
                apply(&mut backward, "k", &b.0, b.1, b.2);
                apply(&mut backward, "k", &a.0, a.1, a.2);

                assert_eq!(forward.get("k"), backward.get("k"), "{:?} vs {:?}", a, b);
            }
        }
    }
}
