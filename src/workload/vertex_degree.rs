//! Computes the out-degree of every vertex in an edge-list graph.
//!
//! Input files hold one `u v` edge per line.

use crate::KeyValue;

pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|u| KeyValue { key: u.to_string(), value: "1".to_string() })
        .collect()
}

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
    fn map_emits_one_record_per_edge_source() {
        let kvs = map("g", "1 2\n1 3\n2 3\n");
        let got: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(got, vec!["1", "1", "2"]);
    }
}
