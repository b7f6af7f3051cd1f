use std::collections::HashSet;
use std::hash::Hash;

/// Keep the first record of every key, in input order.
pub fn dedupe<T, K, F>(records: impl IntoIterator<Item = T>, mut key_fn: F) -> Vec<T>
where
    K: Eq + Hash,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(key_fn(record)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn title(record: &Value) -> String {
        record["title"].as_str().unwrap_or_default().to_string()
    }

    #[test]
    fn first_occurrence_wins() {
        let records = vec![
            json!({ "title": "A", "n": 1 }),
            json!({ "title": "B", "n": 2 }),
            json!({ "title": "A", "n": 3 }),
        ];
        let kept = dedupe(records, title);
        assert_eq!(kept, vec![json!({ "title": "A", "n": 1 }), json!({ "title": "B", "n": 2 })]);
    }

    #[test]
    fn distinct_keys_keep_their_order() {
        let kept = dedupe(vec![3, 1, 2, 1, 3], |n| *n);
        assert_eq!(kept, vec![3, 1, 2]);
        assert!(dedupe(Vec::<i32>::new(), |n| *n).is_empty());
    }
}
