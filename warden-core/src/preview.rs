//! Pre-approval previews: a unified diff for each file write and the exact
//! command line for each command step.

use similar::TextDiff;
use std::fmt::Write as _;
use std::path::Path;
use warden_common::util::truncate_with_ellipsis;

use crate::proposal::ExecutionStep;

/// Upper bound on the rendered preview, in characters.
pub const MAX_PREVIEW_CHARS: usize = 2000;

/// Existing files larger than this are not read for diffing.
const MAX_DIFF_SOURCE_BYTES: u64 = 1024 * 1024;

/// Render every step of a proposal, capped at [`MAX_PREVIEW_CHARS`].
pub fn render(steps: &[ExecutionStep]) -> String {
    let mut out = String::new();
    for step in steps {
        if !out.is_empty() {
            out.push('\n');
        }
        match step {
            ExecutionStep::WriteFile { path, content } => out.push_str(&file_diff(path, content)),
            ExecutionStep::RunCommand { program, args, cwd } => {
                let _ = writeln!(
                    out,
                    "$ {}\n(cwd={})",
                    warden_tools::security::canonical_command(program, args),
                    cwd.display()
                );
            }
        }
    }
    truncate_with_ellipsis(&out, MAX_PREVIEW_CHARS)
}

/// Diff of the file as it is now against `content`. A missing file diffs
/// as empty.
fn file_diff(path: &Path, content: &str) -> String {
    let before = match current_text(path) {
        Ok(text) => text,
        Err(note) => return format!("{}: {note}\n", path.display()),
    };
    if before == content {
        return format!("{}: unchanged\n", path.display());
    }
    let label = path.display();
    TextDiff::from_lines(before.as_str(), content)
        .unified_diff()
        .header(&format!("{label}:before"), &format!("{label}:after"))
        .to_string()
}

fn current_text(path: &Path) -> Result<String, &'static str> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(_) => return Err("current content unreadable"),
    };
    if !meta.is_file() {
        return Err("not a regular file");
    }
    if meta.len() > MAX_DIFF_SOURCE_BYTES {
        return Err("current content too large to diff");
    }
    let bytes = std::fs::read(path).map_err(|_| "current content unreadable")?;
    String::from_utf8(bytes).map_err(|_| "current content is not UTF-8")
}
