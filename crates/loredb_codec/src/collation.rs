//! View-key collation.
//!
//! Defines a single total order over JSON values, used both for ordering
//! emitted view rows and for evaluating range queries. The default Unicode
//! order follows the CouchDB collation specification; ASCII mode compares
//! strings byte-wise instead of by codepoint; Raw mode ranks value kinds by
//! the raw order of their JSON encoding.

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Collation mode for a view's key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    /// CouchDB order: null < false < true < number < string < array < object,
    /// strings compared by Unicode codepoint.
    #[default]
    Unicode,
    /// Same kind order as Unicode, strings compared by raw UTF-8 bytes.
    Ascii,
    /// Kind order of the raw JSON encoding:
    /// number < false < null < true < object < array < string.
    Raw,
}

impl Collation {
    /// Compares two values under this collation.
    pub fn cmp_values(self, a: &Value, b: &Value) -> Ordering {
        self.cmp_limited(a, b, usize::MAX)
    }

    /// Compares two values, considering at most `array_limit` leading
    /// elements of top-level arrays.
    ///
    /// Used for grouped-key comparisons: with `array_limit = N`, two array
    /// keys that agree on their first N elements compare equal. A limit of
    /// zero is treated as unlimited.
    pub fn cmp_limited(self, a: &Value, b: &Value, array_limit: usize) -> Ordering {
        let limit = if array_limit == 0 {
            usize::MAX
        } else {
            array_limit
        };
        self.cmp_at_depth(a, b, limit)
    }

    fn cmp_at_depth(self, a: &Value, b: &Value, array_limit: usize) -> Ordering {
        let rank_a = self.kind_rank(a);
        let rank_b = self.kind_rank(b);
        if rank_a != rank_b {
            return rank_a.cmp(&rank_b);
        }

        match (a, b) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
            (Value::String(x), Value::String(y)) => match self {
                Collation::Ascii | Collation::Raw => x.as_bytes().cmp(y.as_bytes()),
                Collation::Unicode => cmp_unicode_strings(x, y),
            },
            (Value::Array(x), Value::Array(y)) => {
                for (i, (xe, ye)) in x.iter().zip(y.iter()).enumerate() {
                    if i >= array_limit {
                        return Ordering::Equal;
                    }
                    // Nested arrays always compare in full.
                    let ord = self.cmp_at_depth(xe, ye, usize::MAX);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                if x.len().min(array_limit) == y.len().min(array_limit) {
                    Ordering::Equal
                } else {
                    // All compared elements equal: the shorter array first.
                    x.len().cmp(&y.len())
                }
            }
            (Value::Object(x), Value::Object(y)) => self.cmp_objects(x, y),
            _ => unreachable!("kind ranks matched for differing kinds"),
        }
    }

    fn cmp_objects(self, a: &Map<String, Value>, b: &Map<String, Value>) -> Ordering {
        let mut a_entries: Vec<(&String, &Value)> = a.iter().collect();
        let mut b_entries: Vec<(&String, &Value)> = b.iter().collect();
        a_entries.sort_unstable_by(|x, y| x.0.as_bytes().cmp(y.0.as_bytes()));
        b_entries.sort_unstable_by(|x, y| x.0.as_bytes().cmp(y.0.as_bytes()));

        for ((ka, va), (kb, vb)) in a_entries.iter().zip(b_entries.iter()) {
            let key_ord = ka.as_bytes().cmp(kb.as_bytes());
            if key_ord != Ordering::Equal {
                return key_ord;
            }
            let val_ord = self.cmp_at_depth(va, vb, usize::MAX);
            if val_ord != Ordering::Equal {
                return val_ord;
            }
        }
        a_entries.len().cmp(&b_entries.len())
    }

    fn kind_rank(self, v: &Value) -> u8 {
        match self {
            Collation::Unicode | Collation::Ascii => match v {
                Value::Null => 0,
                Value::Bool(false) => 1,
                Value::Bool(true) => 2,
                Value::Number(_) => 3,
                Value::String(_) => 4,
                Value::Array(_) => 5,
                Value::Object(_) => 6,
            },
            Collation::Raw => match v {
                Value::Number(_) => 0,
                Value::Bool(false) => 1,
                Value::Null => 2,
                Value::Bool(true) => 3,
                Value::Object(_) => 4,
                Value::Array(_) => 5,
                Value::String(_) => 6,
            },
        }
    }
}

/// Compares two strings in Unicode collation order.
///
/// Letters compare case-insensitively by folded codepoint; when two strings
/// are equal ignoring case, the lowercase form sorts first ("a" < "A" < "aa").
/// This approximates ICU default-locale ordering without a locale table.
fn cmp_unicode_strings(a: &str, b: &str) -> Ordering {
    let folded = a
        .chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase));
    if folded != Ordering::Equal {
        return folded;
    }
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            return match (ca.is_uppercase(), cb.is_uppercase()) {
                (false, true) => Ordering::Less,
                (true, false) => Ordering::Greater,
                _ => ca.cmp(&cb),
            };
        }
    }
    a.chars().count().cmp(&b.chars().count())
}

/// Compares two JSON numbers by numeric value.
///
/// Integer pairs compare exactly; mixed integer/float pairs go through f64.
/// Textual representation never matters: a key parsed from "0123" is the
/// number 123.
fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NEG_INFINITY);
    let y = b.as_f64().unwrap_or(f64::NEG_INFINITY);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn unicode(a: &Value, b: &Value) -> Ordering {
        Collation::Unicode.cmp_values(a, b)
    }

    #[test]
    fn kind_order_unicode() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(7),
            json!("a"),
            json!(["a"]),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(unicode(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn kind_order_raw() {
        let ordered = [
            json!(7),
            json!(false),
            json!(null),
            json!(true),
            json!({"a": 1}),
            json!(["a"]),
            json!("a"),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                Collation::Raw.cmp_values(&pair[0], &pair[1]),
                Ordering::Less
            );
        }
    }

    #[test]
    fn numbers_by_value() {
        assert_eq!(unicode(&json!(2), &json!(2.0)), Ordering::Equal);
        assert_eq!(unicode(&json!(2.5), &json!(10)), Ordering::Less);
        assert_eq!(unicode(&json!(-1), &json!(0)), Ordering::Less);
        let leading_zero: Value = serde_json::from_str("123").unwrap();
        assert_eq!(unicode(&leading_zero, &json!(123)), Ordering::Equal);
    }

    #[test]
    fn unicode_strings_lowercase_first() {
        assert_eq!(unicode(&json!("a"), &json!("b")), Ordering::Less);
        assert_eq!(unicode(&json!("a"), &json!("A")), Ordering::Less);
        assert_eq!(unicode(&json!("A"), &json!("aa")), Ordering::Less);
        assert_eq!(unicode(&json!("b"), &json!("B")), Ordering::Less);
        assert_eq!(unicode(&json!("B"), &json!("ba")), Ordering::Less);
        assert_eq!(unicode(&json!("z"), &json!("é")), Ordering::Less);
    }

    #[test]
    fn ascii_strings_byte_wise() {
        assert_eq!(
            Collation::Ascii.cmp_values(&json!("A"), &json!("a")),
            Ordering::Less
        );
        assert_eq!(
            Collation::Ascii.cmp_values(&json!("z"), &json!("é")),
            Ordering::Less
        );
    }

    #[test]
    fn arrays_element_wise_shorter_first() {
        assert_eq!(unicode(&json!(["a"]), &json!(["b"])), Ordering::Less);
        assert_eq!(unicode(&json!(["b"]), &json!(["b", "c"])), Ordering::Less);
        assert_eq!(
            unicode(&json!(["b", "c", "a"]), &json!(["b", "d"])),
            Ordering::Less
        );
        assert_eq!(unicode(&json!([1, 2]), &json!([1, 2])), Ordering::Equal);
    }

    #[test]
    fn array_limit_truncates_top_level() {
        let a = json!(["x", 1]);
        let b = json!(["x", 2]);
        assert_eq!(Collation::Unicode.cmp_limited(&a, &b, 1), Ordering::Equal);
        assert_eq!(Collation::Unicode.cmp_limited(&a, &b, 2), Ordering::Less);
        // Zero means unlimited.
        assert_eq!(Collation::Unicode.cmp_limited(&a, &b, 0), Ordering::Less);
    }

    #[test]
    fn array_limit_ignores_extra_elements() {
        let a = json!(["x", 1, "tail"]);
        let b = json!(["x", 1]);
        assert_eq!(Collation::Unicode.cmp_limited(&a, &b, 2), Ordering::Equal);
    }

    #[test]
    fn nested_arrays_compare_in_full_under_limit() {
        let a = json!([["p", 1]]);
        let b = json!([["p", 2]]);
        assert_eq!(Collation::Unicode.cmp_limited(&a, &b, 1), Ordering::Less);
    }

    #[test]
    fn objects_entry_wise() {
        assert_eq!(
            unicode(&json!({"a": 1}), &json!({"a": 2})),
            Ordering::Less
        );
        assert_eq!(
            unicode(&json!({"a": 1}), &json!({"b": 1})),
            Ordering::Less
        );
        assert_eq!(
            unicode(&json!({"a": 1}), &json!({"a": 1, "b": 2})),
            Ordering::Less
        );
    }

    #[test]
    fn spec_fixture_order() {
        let fixture = [
            json!(null),
            json!(false),
            json!(true),
            json!(0),
            json!(2.5),
            json!(10),
            json!(" "),
            json!("_"),
            json!("~"),
            json!("a"),
            json!("A"),
            json!("aa"),
            json!("b"),
            json!("B"),
            json!("ba"),
            json!("bb"),
            json!(["a"]),
            json!(["b"]),
            json!(["b", "c"]),
            json!(["b", "c", "a"]),
            json!(["b", "d"]),
            json!(["b", "d", "e"]),
        ];
        for pair in fixture.windows(2) {
            assert_eq!(
                unicode(&pair[0], &pair[1]),
                Ordering::Less,
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            (-1.0e9f64..1.0e9).prop_map(|f| json!(f)),
            "[a-z]{0,6}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn total_order_is_antisymmetric(a in arb_value(), b in arb_value()) {
            let ab = Collation::Unicode.cmp_values(&a, &b);
            let ba = Collation::Unicode.cmp_values(&b, &a);
            prop_assert_eq!(ab, ba.reverse());
        }

        #[test]
        fn total_order_is_transitive(
            a in arb_value(),
            b in arb_value(),
            c in arb_value(),
        ) {
            let mut sorted = vec![a, b, c];
            sorted.sort_by(|x, y| Collation::Unicode.cmp_values(x, y));
            for pair in sorted.windows(2) {
                prop_assert_ne!(
                    Collation::Unicode.cmp_values(&pair[0], &pair[1]),
                    Ordering::Greater
                );
            }
        }
    }
}
