//! Token-bounded context assembly helpers

use crate::tokenizer::Tokenizer;

/// Column separator of rendered context tables
pub const CSV_SEPARATOR: &str = ",\t";

/// Render a header and rows as a `,\t` separated table. Newlines inside
/// cells are flattened so each row stays on one line.
pub fn csv_table<S: AsRef<str>>(header: &[&str], rows: &[Vec<S>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(header.join(CSV_SEPARATOR));
    for row in rows {
        lines.push(
            row.iter()
                .map(|cell| cell.as_ref().replace(['\n', '\r'], " "))
                .collect::<Vec<_>>()
                .join(CSV_SEPARATOR),
        );
    }
    lines.join("\n")
}

/// Longest prefix of `items` whose rendered texts fit in `max_tokens`.
///
/// Items are taken in order and the scan stops at the first one that would
/// overflow, so the result is always a prefix.
pub fn truncate_by_tokens<T, F>(
    tokenizer: &Tokenizer,
    items: Vec<T>,
    max_tokens: usize,
    text: F,
) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut used = 0;
    let mut kept = Vec::new();
    for item in items {
        let cost = tokenizer.count(&text(&item));
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        kept.push(item);
    }
    kept
}

/// Group items, in order, into batches whose rendered texts each fit in
/// `max_tokens`. An item larger than the budget forms a batch of its own.
pub fn group_by_tokens<T, F>(
    tokenizer: &Tokenizer,
    items: Vec<T>,
    max_tokens: usize,
    text: F,
) -> Vec<Vec<T>>
where
    F: Fn(&T) -> String,
{
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for item in items {
        let cost = tokenizer.count(&text(&item));
        if !current.is_empty() && used + cost > max_tokens {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(item);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_table() {
        let table = csv_table(&["id", "name"], &[vec!["0", "Alice\nSmith"], vec!["1", "Bob"]]);
        assert_eq!(table, "id,\tname\n0,\tAlice Smith\n1,\tBob");
    }

    #[test]
    fn test_truncate_stops_at_first_overflow() {
        let t = Tokenizer::shared().unwrap();
        let items = vec!["short".to_string(), "word ".repeat(100), "tiny".to_string()];
        let kept = truncate_by_tokens(&t, items, 20, |s| s.clone());
        assert_eq!(kept, vec!["short".to_string()]);
    }

    #[test]
    fn test_group_by_tokens() {
        let t = Tokenizer::shared().unwrap();
        let items: Vec<String> = (0..10).map(|_| "alpha beta gamma".to_string()).collect();
        let per_item = t.count("alpha beta gamma");
        let groups = group_by_tokens(&t, items, per_item * 3, |s| s.clone());
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().take(3).all(|g| g.len() == 3));
    }
}
