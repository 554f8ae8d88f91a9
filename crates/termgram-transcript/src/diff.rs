//! Minimal unified diff for Edit tool results.
//!
//! Produces hunks with 3 lines of context and `@@` headers, without the
//! `---`/`+++` file header lines (they carry no information here).

const CONTEXT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Compute a unified diff between two strings, line-based.
///
/// Returns an empty string when the inputs are identical.
pub fn unified_diff(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = diff_ops(&old_lines, &new_lines);

    if !ops.iter().any(|(op, _, _)| *op != Op::Equal) {
        return String::new();
    }

    let mut out: Vec<String> = Vec::new();
    let mut i = 0;
    while i < ops.len() {
        if ops[i].0 == Op::Equal {
            i += 1;
            continue;
        }
        // Start of a change group. Expand to a hunk with surrounding context.
        let mut j = i;
        // Include subsequent changes separated by <= 2*CONTEXT equal lines.
        let mut k = i;
        while k < ops.len() {
            if ops[k].0 != Op::Equal {
                j = k;
                k += 1;
            } else {
                let run_start = k;
                while k < ops.len() && ops[k].0 == Op::Equal {
                    k += 1;
                }
                if k < ops.len() && k - run_start <= 2 * CONTEXT {
                    continue;
                }
                break;
            }
        }

        let hunk_start = i.saturating_sub(CONTEXT);
        let hunk_end = (j + 1 + CONTEXT).min(ops.len());

        let old_start = ops[hunk_start].1;
        let new_start = ops[hunk_start].2;
        let old_count = ops[hunk_start..hunk_end]
            .iter()
            .filter(|(op, _, _)| *op != Op::Insert)
            .count();
        let new_count = ops[hunk_start..hunk_end]
            .iter()
            .filter(|(op, _, _)| *op != Op::Delete)
            .count();

        out.push(format!(
            "@@ -{},{} +{},{} @@",
            old_start + 1,
            old_count,
            new_start + 1,
            new_count
        ));
        for (op, oi, ni) in &ops[hunk_start..hunk_end] {
            match op {
                Op::Equal => out.push(format!(" {}", old_lines[*oi])),
                Op::Delete => out.push(format!("-{}", old_lines[*oi])),
                Op::Insert => out.push(format!("+{}", new_lines[*ni])),
            }
        }

        i = hunk_end;
    }

    out.join("\n")
}

/// Count (added, removed) lines in a rendered diff, excluding hunk headers.
pub fn count_changes(diff_text: &str) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    for line in diff_text.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            added += 1;
        } else if line.starts_with('-') {
            removed += 1;
        }
    }
    (added, removed)
}

/// LCS-based edit script. Each op carries the (old index, new index) cursor
/// position at the time it applies, so hunk headers can be derived.
fn diff_ops(old: &[&str], new: &[&str]) -> Vec<(Op, usize, usize)> {
    let n = old.len();
    let m = new.len();
    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push((Op::Equal, i, j));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push((Op::Delete, i, j));
            i += 1;
        } else {
            ops.push((Op::Insert, i, j));
            j += 1;
        }
    }
    while i < n {
        ops.push((Op::Delete, i, j));
        i += 1;
    }
    while j < m {
        ops.push((Op::Insert, i, j));
        j += 1;
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_empty_diff() {
        assert_eq!(unified_diff("a\nb\nc", "a\nb\nc"), "");
    }

    #[test]
    fn single_line_change() {
        let d = unified_diff("a\nb\nc", "a\nB\nc");
        assert!(d.contains("-b"), "diff was: {d}");
        assert!(d.contains("+B"), "diff was: {d}");
        assert!(d.starts_with("@@"), "diff was: {d}");
    }

    #[test]
    fn pure_insertion() {
        let d = unified_diff("a\nc", "a\nb\nc");
        let (added, removed) = count_changes(&d);
        assert_eq!((added, removed), (1, 0));
    }

    #[test]
    fn pure_deletion() {
        let d = unified_diff("a\nb\nc", "a\nc");
        let (added, removed) = count_changes(&d);
        assert_eq!((added, removed), (0, 1));
    }

    #[test]
    fn distant_changes_get_separate_hunks() {
        let old: Vec<String> = (0..30).map(|i| format!("line{i}")).collect();
        let mut new = old.clone();
        new[1] = "changed-early".into();
        new[28] = "changed-late".into();
        let d = unified_diff(&old.join("\n"), &new.join("\n"));
        let hunks = d.lines().filter(|l| l.starts_with("@@")).count();
        assert_eq!(hunks, 2, "diff was:\n{d}");
    }

    #[test]
    fn count_ignores_header_lines() {
        let (added, removed) = count_changes("--- x\n+++ y\n@@ -1 +1 @@\n-old\n+new");
        assert_eq!((added, removed), (1, 1));
    }
}
