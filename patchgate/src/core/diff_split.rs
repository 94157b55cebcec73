//! Split a multi-file unified diff into per-file bundle items.
//!
//! A line-oriented state machine with two states, outside a file and inside
//! one. Inside a file we track the remaining line budget of the current hunk,
//! so a removed line that happens to start with `--` is never mistaken for the
//! next file's `---` header.

use crate::core::types::BundleItem;

/// Target recorded for a diff with no recognizable file headers.
pub const FALLBACK_TARGET: &str = "(unknown)";

const GIT_HEADER: &str = "diff --git ";
const OLD_FILE: &str = "--- ";
const NEW_FILE: &str = "+++ ";
const HUNK: &str = "@@ ";
const DEV_NULL: &str = "/dev/null";
/// Extended git headers that name the source or destination of a rename or copy.
const PATH_HEADERS: [&str; 4] = ["rename from ", "rename to ", "copy from ", "copy to "];

/// One recovered file segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffSegment {
    pub file: String,
    pub text: String,
    /// Every path named by the segment's headers, old and new, in order of appearance.
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HunkBudget {
    old: u64,
    new: u64,
}

impl HunkBudget {
    fn exhausted(self) -> bool {
        self.old == 0 && self.new == 0
    }
}

#[derive(Debug)]
enum State {
    Outside,
    InFile {
        segment: SegmentBuilder,
        hunk: Option<HunkBudget>,
    },
}

#[derive(Debug, Default)]
struct SegmentBuilder {
    text: String,
    git_path: Option<String>,
    old_path: Option<String>,
    new_path: Option<String>,
    paths: Vec<String>,
    saw_old_marker: bool,
    saw_hunk: bool,
}

impl SegmentBuilder {
    fn target(&self) -> Option<String> {
        self.new_path
            .clone()
            .or_else(|| self.old_path.clone())
            .or_else(|| self.git_path.clone())
    }

    fn note_path(&mut self, path: Option<&String>) {
        if let Some(path) = path
            && !self.paths.contains(path)
        {
            self.paths.push(path.clone());
        }
    }

    fn finish(mut self) -> DiffSegment {
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        let file = self.target().unwrap_or_else(|| FALLBACK_TARGET.to_string());
        DiffSegment {
            file,
            text: self.text,
            paths: self.paths,
        }
    }
}

/// Split `diff` into per-file segments, preserving input order and line endings.
///
/// A diff without any file headers comes back as a single [`FALLBACK_TARGET`]
/// segment holding the whole text.
pub fn split_diff(diff: &str) -> Vec<DiffSegment> {
    let mut segments = Vec::new();
    let mut state = State::Outside;

    for line in diff.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\n', '\r']);
        state = match state {
            State::Outside => {
                if bare.starts_with(GIT_HEADER) || bare.starts_with(OLD_FILE) {
                    open_segment(line, bare)
                } else {
                    // Prose before the first header is dropped.
                    State::Outside
                }
            }
            State::InFile {
                segment,
                hunk: Some(budget),
            } if header_breaks_hunk(budget, bare) => {
                segments.push(segment.finish());
                open_segment(line, bare)
            }
            State::InFile {
                mut segment,
                hunk: Some(mut budget),
            } => {
                consume_hunk_line(bare, &mut budget);
                segment.text.push_str(line);
                State::InFile {
                    segment,
                    hunk: (!budget.exhausted()).then_some(budget),
                }
            }
            State::InFile {
                mut segment,
                hunk: None,
            } => {
                if starts_new_file(&segment, bare) {
                    segments.push(segment.finish());
                    open_segment(line, bare)
                } else {
                    let hunk = if bare.starts_with(HUNK) {
                        segment.saw_hunk = true;
                        parse_hunk_header(bare).filter(|budget| !budget.exhausted())
                    } else {
                        record_header(&mut segment, bare);
                        None
                    };
                    segment.text.push_str(line);
                    State::InFile { segment, hunk }
                }
            }
        };
    }

    if let State::InFile { segment, .. } = state {
        segments.push(segment.finish());
    }

    if segments.is_empty() && !diff.trim().is_empty() {
        let mut text = diff.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        segments.push(DiffSegment {
            file: FALLBACK_TARGET.to_string(),
            text,
            paths: Vec::new(),
        });
    }
    segments
}

/// Every path any file header in `diff` names, including deletion sources and
/// rename or copy endpoints. `/dev/null` is never reported.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for path in split_diff(diff).into_iter().flat_map(|segment| segment.paths) {
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Split `diff` into bundle items, each described by `description`.
pub fn split_into_items(diff: &str, description: &str) -> Vec<BundleItem> {
    split_diff(diff)
        .into_iter()
        .map(|segment| BundleItem::new(segment.file, segment.text, description))
        .collect()
}

fn open_segment(line: &str, bare: &str) -> State {
    let mut segment = SegmentBuilder::default();
    record_header(&mut segment, bare);
    segment.text.push_str(line);
    State::InFile {
        segment,
        hunk: None,
    }
}

/// Between hunks, a `diff --git` header always opens a new file; a `---` header
/// does so unless it belongs to the current file's own header block.
fn starts_new_file(segment: &SegmentBuilder, bare: &str) -> bool {
    if bare.starts_with(GIT_HEADER) {
        return true;
    }
    bare.starts_with(OLD_FILE) && (segment.saw_hunk || segment.saw_old_marker)
}

/// Generated diffs often miscount hunk lengths. A `diff --git` header, or a
/// `---` header once no removed lines remain, ends the hunk early.
fn header_breaks_hunk(budget: HunkBudget, bare: &str) -> bool {
    bare.starts_with(GIT_HEADER) || (bare.starts_with(OLD_FILE) && budget.old == 0)
}

fn record_header(segment: &mut SegmentBuilder, bare: &str) {
    if let Some(rest) = bare.strip_prefix(GIT_HEADER) {
        let (old, new) = parse_git_header(rest);
        segment.note_path(old.as_ref());
        segment.note_path(new.as_ref());
        segment.git_path = new;
    } else if let Some(rest) = bare.strip_prefix(OLD_FILE) {
        segment.saw_old_marker = true;
        segment.old_path = header_path(rest, "a/");
        let old = segment.old_path.clone();
        segment.note_path(old.as_ref());
    } else if let Some(rest) = bare.strip_prefix(NEW_FILE) {
        segment.new_path = header_path(rest, "b/");
        let new = segment.new_path.clone();
        segment.note_path(new.as_ref());
    } else if let Some(rest) = PATH_HEADERS
        .iter()
        .find_map(|header| bare.strip_prefix(header))
    {
        segment.note_path(header_path(rest, "").as_ref());
    }
}

fn consume_hunk_line(bare: &str, budget: &mut HunkBudget) {
    match bare.as_bytes().first() {
        Some(b'-') => budget.old = budget.old.saturating_sub(1),
        Some(b'+') => budget.new = budget.new.saturating_sub(1),
        // "\ No newline at end of file" does not count against either side.
        Some(b'\\') => {}
        // Context line (some generators strip the leading space of blank lines).
        _ => {
            budget.old = budget.old.saturating_sub(1);
            budget.new = budget.new.saturating_sub(1);
        }
    }
}

/// Parse `@@ -l[,s] +l[,s] @@` into line budgets; `None` for a malformed header.
fn parse_hunk_header(bare: &str) -> Option<HunkBudget> {
    let mut parts = bare.split_whitespace().skip(1);
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    Some(HunkBudget {
        old: range_len(old)?,
        new: range_len(new)?,
    })
}

fn range_len(range: &str) -> Option<u64> {
    match range.split_once(',') {
        Some((_, len)) => len.parse().ok(),
        None => {
            range.parse::<u64>().ok()?;
            Some(1)
        }
    }
}

/// Extract the path from a `---`/`+++` header, dropping timestamps and the `a/`/`b/` prefix.
fn header_path(rest: &str, prefix: &str) -> Option<String> {
    let raw = rest.split('\t').next().unwrap_or(rest).trim();
    let raw = raw.trim_matches('"');
    if raw.is_empty() || raw == DEV_NULL {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

/// Split `a/<old> b/<new>` into its two paths.
fn parse_git_header(rest: &str) -> (Option<String>, Option<String>) {
    let Some((old, new)) = rest.rsplit_once(" b/") else {
        return (None, None);
    };
    let non_empty = |path: &str| {
        let path = path.trim();
        (!path.is_empty()).then(|| path.to_string())
    };
    let old = old.trim().trim_matches('"');
    (non_empty(old.strip_prefix("a/").unwrap_or(old)), non_empty(new))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FILES: &str = "\
--- a/README.md
+++ b/README.md
@@ -1,2 +1,3 @@
 # Title
 body
+added
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1 +1 @@
-fn a() {}
+fn b() {}
";

    #[test]
    fn splits_two_files_in_input_order() {
        let segments = split_diff(TWO_FILES);
        let files: Vec<&str> = segments.iter().map(|s| s.file.as_str()).collect();
        assert_eq!(files, vec!["README.md", "src/lib.rs"]);
        assert!(segments[0].text.starts_with("--- a/README.md\n"));
        assert!(segments[0].text.ends_with("+added\n"));
        assert!(segments[1].text.starts_with("--- a/src/lib.rs\n"));
    }

    #[test]
    fn segments_concatenate_back_to_the_input() {
        let joined: String = split_diff(TWO_FILES)
            .into_iter()
            .map(|segment| segment.text)
            .collect();
        assert_eq!(joined, TWO_FILES);
    }

    #[test]
    fn git_headers_open_segments_with_their_index_lines() {
        let diff = "\
diff --git a/a.txt b/a.txt
index 1111111..2222222 100644
--- a/a.txt
+++ b/a.txt
@@ -1 +1 @@
-a
+A
diff --git a/b.txt b/b.txt
index 3333333..4444444 100644
--- a/b.txt
+++ b/b.txt
@@ -1 +1 @@
-b
+B
";
        let segments = split_diff(diff);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].file, "a.txt");
        assert_eq!(segments[1].file, "b.txt");
        assert!(segments[1].text.starts_with("diff --git a/b.txt b/b.txt\n"));
        assert!(!segments[0].text.contains("b.txt"));
    }

    #[test]
    fn removed_lines_that_look_like_headers_stay_in_the_hunk() {
        let diff = "\
--- a/schema.sql
+++ b/schema.sql
@@ -1,2 +1,1 @@
--- drop me
 create table t;
";
        let segments = split_diff(diff);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].file, "schema.sql");
        assert!(segments[0].text.contains("--- drop me"));
    }

    #[test]
    fn overcounted_hunk_does_not_swallow_next_file() {
        let diff = "\
--- a/a.txt
+++ b/a.txt
@@ -1 +1,5 @@
-a
+A
--- a/b.txt
+++ b/b.txt
@@ -1 +1 @@
-b
+B
";
        let segments = split_diff(diff);
        let files: Vec<&str> = segments.iter().map(|s| s.file.as_str()).collect();
        assert_eq!(files, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn deletions_fall_back_to_old_path() {
        let diff = "\
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-gone
";
        let segments = split_diff(diff);
        assert_eq!(segments[0].file, "old.txt");
    }

    #[test]
    fn new_files_use_new_path_and_strip_timestamps() {
        let diff = "--- /dev/null\t2024-01-01 00:00:00\n+++ b/new.txt\t2024-01-01 00:00:00\n@@ -0,0 +1 @@\n+hello\n";
        let segments = split_diff(diff);
        assert_eq!(segments[0].file, "new.txt");
    }

    #[test]
    fn headerless_diff_becomes_single_fallback_item() {
        let items = split_into_items("just some text", "goal");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].file, FALLBACK_TARGET);
        assert_eq!(items[0].diff, "just some text\n");
        assert_eq!(items[0].description, "goal");
    }

    #[test]
    fn leading_prose_is_dropped() {
        let diff = format!("Here is the change:\n{TWO_FILES}");
        let segments = split_diff(&diff);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].text.starts_with("--- a/README.md"));
    }

    #[test]
    fn crlf_lines_are_preserved_verbatim() {
        let diff = "--- a/w.txt\r\n+++ b/w.txt\r\n@@ -1 +1 @@\r\n-a\r\n+b\r\n";
        let segments = split_diff(diff);
        assert_eq!(segments[0].file, "w.txt");
        assert_eq!(segments[0].text, diff);
    }

    #[test]
    fn empty_diff_yields_no_segments() {
        assert!(split_diff("  \n").is_empty());
    }

    #[test]
    fn touched_paths_include_deleted_and_renamed_sources() {
        let diff = "\
diff --git a/yarn.lock b/yarn.lock
deleted file mode 100644
--- a/yarn.lock
+++ /dev/null
@@ -1 +0,0 @@
-lock
diff --git a/README.md b/package-lock.json
similarity index 100%
rename from README.md
rename to package-lock.json
";
        let segments = split_diff(diff);
        assert_eq!(segments[0].file, "yarn.lock");
        assert_eq!(segments[0].paths, vec!["yarn.lock"]);
        assert_eq!(segments[1].file, "package-lock.json");
        assert_eq!(
            touched_paths(diff),
            vec!["yarn.lock", "README.md", "package-lock.json"]
        );
    }

    #[test]
    fn header_lookalikes_inside_hunks_are_not_paths() {
        let diff = "\
--- a/notes.txt
+++ b/notes.txt
@@ -1,2 +1,2 @@
-rename to yarn.lock
+rename to nothing
 keep
";
        assert_eq!(touched_paths(diff), vec!["notes.txt"]);
    }

    #[test]
    fn parses_hunk_ranges() {
        assert_eq!(
            parse_hunk_header("@@ -1,3 +1,4 @@ fn main"),
            Some(HunkBudget { old: 3, new: 4 })
        );
        assert_eq!(
            parse_hunk_header("@@ -7 +7 @@"),
            Some(HunkBudget { old: 1, new: 1 })
        );
        assert_eq!(parse_hunk_header("@@ garbage @@"), None);
    }
}
