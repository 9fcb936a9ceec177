//! Unified diffs between snapshot contents.

use similar::{ChangeTag, TextDiff};

/// A rendered diff plus its added/removed line counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffStats {
    pub text: String,
    pub added: usize,
    pub removed: usize,
}

impl DiffStats {
    /// Whether the two inputs differed at all.
    pub fn changed(&self) -> bool {
        self.added + self.removed > 0
    }
}

/// Compute a unified diff with three lines of context.
pub fn unified_diff(before: &str, after: &str) -> DiffStats {
    let diff = TextDiff::from_lines(before, after);

    let mut added = 0usize;
    let mut removed = 0usize;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }

    let text = diff
        .unified_diff()
        .context_radius(3)
        .header("before", "after")
        .to_string();

    DiffStats {
        text,
        added,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_inputs() {
        let stats = unified_diff("a\nb\n", "a\nb\n");
        assert_eq!(stats.added, 0);
        assert_eq!(stats.removed, 0);
        assert!(!stats.changed());
    }

    #[test]
    fn test_added_line_counted() {
        let stats = unified_diff("port 22\n", "port 22\nallow all\n");
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed, 0);
        assert!(stats.changed());
        assert!(stats.text.contains("+allow all"));
    }

    #[test]
    fn test_replacement_counts_both_sides() {
        let stats = unified_diff("timeout 30\n", "timeout 60\n");
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed, 1);
        assert!(stats.text.contains("-timeout 30"));
        assert!(stats.text.contains("+timeout 60"));
    }
}
