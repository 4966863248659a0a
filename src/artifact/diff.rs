//! Compact unified-style diff summaries.
//!
//! Produces a single hunk covering everything between the common prefix and
//! common suffix of two texts, with up to [`CONTEXT`] lines of context on
//! either side. Output is capped at a caller-chosen number of body lines.

/// Context lines kept around the changed region.
pub const CONTEXT: usize = 3;

/// Above this many cells the middle is shown as a plain replacement.
const LCS_CELL_LIMIT: usize = 250_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op<'a> {
    Keep(&'a str),
    Del(&'a str),
    Ins(&'a str),
}

/// Summarize the change from `previous` to `current`.
///
/// `None` for `previous` means the path is new.
///
/// ```
/// use llm_relay::artifact::diff::summarize;
///
/// assert_eq!(summarize(None, "a\nb\n", 10), "created (2 lines)");
/// let d = summarize(Some("a\nb\nc"), "a\nB\nc", 10);
/// assert_eq!(d, "@@ -1,3 +1,3 @@\n a\n-b\n+B\n c");
/// ```
pub fn summarize(previous: Option<&str>, current: &str, max_lines: usize) -> String {
    let Some(previous) = previous else {
        return format!("created ({} lines)", current.lines().count());
    };
    if previous == current {
        return "unchanged".to_string();
    }

    let old: Vec<&str> = previous.lines().collect();
    let new: Vec<&str> = current.lines().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    if old_mid.is_empty() && new_mid.is_empty() {
        // only line endings differ
        return "whitespace-only change".to_string();
    }

    let before = prefix.min(CONTEXT);
    let after = suffix.min(CONTEXT);

    let mut ops: Vec<Op<'_>> = Vec::new();
    ops.extend(old[prefix - before..prefix].iter().map(|l| Op::Keep(l)));
    ops.extend(middle_ops(old_mid, new_mid));
    let tail = old.len() - suffix;
    ops.extend(old[tail..tail + after].iter().map(|l| Op::Keep(l)));

    let old_count = before + old_mid.len() + after;
    let new_count = before + new_mid.len() + after;
    let old_start = if old_count == 0 { prefix } else { prefix - before + 1 };
    let new_start = if new_count == 0 { prefix } else { prefix - before + 1 };

    let mut out = vec![format!("@@ -{old_start},{old_count} +{new_start},{new_count} @@")];
    let body: Vec<String> = ops
        .iter()
        .map(|op| match op {
            Op::Keep(l) => format!(" {l}"),
            Op::Del(l) => format!("-{l}"),
            Op::Ins(l) => format!("+{l}"),
        })
        .collect();
    let hidden = body.len().saturating_sub(max_lines);
    out.extend(body.into_iter().take(max_lines));
    if hidden > 0 {
        out.push(format!("... ({hidden} more lines)"));
    }
    out.join("\n")
}

/// Line-level LCS edit script for the changed middle.
fn middle_ops<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Op<'a>> {
    if old.is_empty() || new.is_empty() || old.len() * new.len() > LCS_CELL_LIMIT {
        return old
            .iter()
            .map(|l| Op::Del(l))
            .chain(new.iter().map(|l| Op::Ins(l)))
            .collect();
    }

    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let (n, m) = (old.len(), new.len());
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Keep(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push(Op::Del(old[i]));
            i += 1;
        } else {
            ops.push(Op::Ins(new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().map(|l| Op::Del(l)));
    ops.extend(new[j..].iter().map(|l| Op::Ins(l)));
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created() {
        assert_eq!(summarize(None, "", 10), "created (0 lines)");
        assert_eq!(summarize(None, "one\ntwo\nthree", 10), "created (3 lines)");
    }

    #[test]
    fn test_append_at_end() {
        let d = summarize(Some("a\nb"), "a\nb\nc", 10);
        assert_eq!(d, "@@ -1,2 +1,3 @@\n a\n b\n+c");
    }

    #[test]
    fn test_context_is_limited() {
        let old = "1\n2\n3\n4\n5\n6\n7\n8";
        let new = "1\n2\n3\n4\nX\n6\n7\n8";
        let d = summarize(Some(old), new, 50);
        assert_eq!(d, "@@ -2,7 +2,7 @@\n 2\n 3\n 4\n-5\n+X\n 6\n 7\n 8");
    }

    #[test]
    fn test_interleaved_change_uses_lcs() {
        let d = summarize(Some("a\nb\nc\nd"), "a\nc\nd\ne", 20);
        assert!(d.contains("\n-b\n"));
        assert!(d.ends_with("+e"));
        assert!(!d.contains("-c"));
    }

    #[test]
    fn test_everything_deleted() {
        let d = summarize(Some("x\ny"), "", 10);
        assert_eq!(d, "@@ -1,2 +0,0 @@\n-x\n-y");
    }

    #[test]
    fn test_truncation() {
        let old: String = (0..100).map(|i| format!("old {i}\n")).collect();
        let new: String = (0..100).map(|i| format!("new {i}\n")).collect();
        let d = summarize(Some(&old), &new, 40);
        let lines: Vec<&str> = d.lines().collect();
        assert_eq!(lines.len(), 42);
        assert_eq!(lines[41], "... (160 more lines)");
    }

    #[test]
    fn test_line_ending_only_change() {
        assert_eq!(summarize(Some("a\nb\n"), "a\nb", 10), "whitespace-only change");
    }
}
