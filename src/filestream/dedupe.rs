//! Console output policy with carriage-return redraw handling.
//!
//! Console lines arrive as `"<timestamp> <text>"` or
//! `"ERROR <timestamp> <text>"`. Progress bars redraw themselves by starting a
//! line with `\r`; a terminal overwrites the current line instead of adding a
//! new one. This policy does the same before upload so a progress bar costs
//! one console line on the collector instead of thousands.
//!
//! Offsets are console line numbers. When a `\r` line arrives for an output
//! class (stdout or stderr) its live buffer freezes the offset it last
//! observed, and every later redraw of that class is re-sent at that same
//! offset with only the newest text.

use super::chunk::Chunk;
use super::policy::{FileOutput, FilePolicy, LineBatch};

#[cfg(windows)]
const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
const LINE_SEPARATOR: &str = "\n";

const ERROR_TAG: &str = "ERROR";

/// Latest redrawn line for one output class.
#[derive(Debug, Default)]
struct LiveLine {
    offset: Option<u64>,
    line: Option<String>,
    frozen: bool,
}

/// Ordinary lines collected during a single invocation.
#[derive(Debug, Default)]
struct OrdinaryLines {
    offset: Option<u64>,
    lines: Vec<String>,
}

impl OrdinaryLines {
    fn last_offset(&self) -> Option<u64> {
        let start = self.offset?;
        (!self.lines.is_empty()).then(|| start + self.lines.len() as u64 - 1)
    }
}

/// Carriage-return deduplicating console policy.
#[derive(Debug, Default)]
pub struct CrDedupeFilePolicy {
    global_offset: u64,
    stderr: LiveLine,
    stdout: LiveLine,
}

/// Split a console chunk into its prefix (with trailing space), remainder and
/// output class.
fn split_prefix(data: &str) -> (String, &str, bool) {
    let Some((token, rest)) = data.split_once(' ') else {
        return (String::new(), data, false);
    };
    if token != ERROR_TAG {
        return (format!("{} ", token), rest, false);
    }
    match rest.split_once(' ') {
        Some((timestamp, rest)) => (format!("{} {} ", ERROR_TAG, timestamp), rest, true),
        None => (format!("{} ", ERROR_TAG), rest, true),
    }
}

impl CrDedupeFilePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_mut(&mut self, is_err: bool) -> &mut LiveLine {
        if is_err {
            &mut self.stderr
        } else {
            &mut self.stdout
        }
    }
}

impl FilePolicy for CrDedupeFilePolicy {
    fn process_chunks(&mut self, chunks: &[Chunk]) -> Option<FileOutput> {
        let mut ordinary = OrdinaryLines::default();

        for chunk in chunks {
            let data = chunk.data.as_text();
            let (prefix, rest, is_err) = split_prefix(&data);

            for line in rest.split(LINE_SEPARATOR) {
                if let Some(redraw) = line.strip_prefix('\r') {
                    let global_offset = self.global_offset;
                    let live = self.live_mut(is_err);
                    live.frozen = true;
                    live.line = Some(format!("{}{}\n", prefix, redraw));

                    // nothing printed yet for this class: claim a fresh line
                    let claimed = live.offset.is_none();
                    let offset = *live.offset.get_or_insert(global_offset);
                    if claimed {
                        self.global_offset += 1;
                    }

                    if ordinary.last_offset() == Some(offset) {
                        ordinary.lines.pop();
                    }
                } else if !line.is_empty() {
                    let global_offset = self.global_offset;
                    ordinary.lines.push(format!("{}{}\n", prefix, line));
                    let live = self.live_mut(is_err);
                    if !live.frozen {
                        live.offset = Some(global_offset);
                    }
                    ordinary.offset.get_or_insert(global_offset);
                    self.global_offset += 1;
                }
            }
        }

        let mut groups = Vec::with_capacity(3);
        for live in [&self.stderr, &self.stdout] {
            if let (Some(offset), Some(line)) = (live.offset, &live.line) {
                groups.push(LineBatch {
                    offset,
                    content: vec![line.clone()],
                });
            }
        }
        if let (Some(offset), false) = (ordinary.offset, ordinary.lines.is_empty()) {
            groups.push(LineBatch {
                offset,
                content: ordinary.lines,
            });
        }

        (!groups.is_empty()).then_some(FileOutput::Groups(groups))
    }
}
