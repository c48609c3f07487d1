//! A MapReduce-compatible implementation of word count.

use crate::KeyValue;

/// Emits `(word, "1")` for every alphabetic word in the input, lowercased.
pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
    contents
        .split(|c: char| !c.is_alphabetic())
        .filter(|s| !s.is_empty())
        .map(|word| KeyValue { key: word.to_lowercase(), value: "1".to_string() })
        .collect()
}

/// Sums the counts emitted for one word.
pub fn reduce(_key: &str, values: &[String]) -> String {
    values
        .iter()
        .filter_map(|v| v.parse::<u64>().ok())
        .sum::<u64>()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_splits_lowercases_and_counts() {
        let kvs = map("in", "The cat, the DOG.");
        let got: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(got, vec!["the", "cat", "the", "dog"]);
        assert!(kvs.iter().all(|kv| kv.value == "1"));
    }

    #[test]
    fn reduce_sums() {
        let values = vec!["1".to_string(), "1".to_string(), "3".to_string()];
        assert_eq!(reduce("the", &values), "5");
    }
}
