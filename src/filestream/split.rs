//! Splitting of large data posts.
//!
//! A data post can carry several files; if their combined content exceeds the
//! per-request limit the files are spread over several posts. Line batches
//! are split between lines with their offsets adjusted; encoded and grouped
//! outputs are never split.

use std::collections::BTreeMap;

use super::policy::{FileOutput, LineBatch};

/// Files of one data post, keyed by filename.
pub type FileSet = BTreeMap<String, FileOutput>;

fn output_size(output: &FileOutput) -> usize {
    match output {
        FileOutput::Lines(batch) => batch.content_bytes(),
        FileOutput::Encoded(batch) => batch.content.len(),
        FileOutput::Groups(groups) => groups.iter().map(LineBatch::content_bytes).sum(),
    }
}

struct Volumes {
    max_bytes: usize,
    done: Vec<FileSet>,
    current: FileSet,
    current_size: usize,
}

impl Volumes {
    fn remaining(&self) -> usize {
        self.max_bytes.saturating_sub(self.current_size)
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.done.push(std::mem::take(&mut self.current));
        }
        self.current_size = 0;
    }

    fn add(&mut self, name: &str, output: FileOutput, size: usize) {
        self.current.insert(name.to_string(), output);
        self.current_size += size;
    }
}

/// Spread `files` over as many posts as needed to keep each post's content
/// within `max_bytes`. A single line or unsplittable output larger than
/// `max_bytes` is sent alone.
pub fn split_files(files: FileSet, max_bytes: usize) -> Vec<FileSet> {
    let mut volumes = Volumes {
        max_bytes,
        done: Vec::new(),
        current: FileSet::new(),
        current_size: 0,
    };

    for (name, output) in files {
        let size = output_size(&output);
        if size <= volumes.remaining() {
            volumes.add(&name, output, size);
            continue;
        }

        match output {
            FileOutput::Lines(batch) => {
                let mut offset = batch.offset;
                let mut pending: Vec<String> = Vec::new();
                let mut pending_size = 0;

                for line in batch.content {
                    let len = line.len();
                    if !pending.is_empty() && pending_size + len > volumes.remaining() {
                        let count = pending.len() as u64;
                        let content = std::mem::take(&mut pending);
                        volumes.add(&name, FileOutput::Lines(LineBatch { offset, content }), pending_size);
                        volumes.flush();
                        offset += count;
                        pending_size = 0;
                    } else if pending.is_empty() && len > volumes.remaining() && !volumes.current.is_empty() {
                        volumes.flush();
                    }
                    pending.push(line);
                    pending_size += len;
                }

                if !pending.is_empty() {
                    volumes.add(&name, FileOutput::Lines(LineBatch { offset, content: pending }), pending_size);
                }
            }
            unsplittable => {
                volumes.flush();
                volumes.add(&name, unsplittable, size);
            }
        }
    }

    volumes.flush();
    volumes.done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestream::policy::EncodedBatch;

    fn lines(offset: u64, content: &[&str]) -> FileOutput {
        FileOutput::Lines(LineBatch {
            offset,
            content: content.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_small_files_share_one_post() {
        let mut files = FileSet::new();
        files.insert("a.txt".into(), lines(0, &["aa", "bb"]));
        files.insert("b.txt".into(), lines(5, &["cc"]));

        let posts = split_files(files.clone(), 100);
        assert_eq!(posts, vec![files]);
    }

    #[test]
    fn test_empty_input_yields_no_posts() {
        assert!(split_files(FileSet::new(), 100).is_empty());
    }

    #[test]
    fn test_large_file_split_with_offsets() {
        let mut files = FileSet::new();
        files.insert("out.txt".into(), lines(10, &["aaaa", "bbbb", "cccc", "dddd", "eeee"]));

        let posts = split_files(files, 8);

        assert_eq!(posts.len(), 3);
        assert_eq!(posts[0]["out.txt"], lines(10, &["aaaa", "bbbb"]));
        assert_eq!(posts[1]["out.txt"], lines(12, &["cccc", "dddd"]));
        assert_eq!(posts[2]["out.txt"], lines(14, &["eeee"]));
    }

    #[test]
    fn test_oversized_line_goes_alone() {
        let mut files = FileSet::new();
        files.insert("a.txt".into(), lines(0, &["xx"]));
        files.insert("b.txt".into(), lines(0, &["yyyyyyyyyyyy", "z"]));

        let posts = split_files(files, 6);

        assert_eq!(posts.len(), 3);
        assert_eq!(posts[0]["a.txt"], lines(0, &["xx"]));
        assert_eq!(posts[1]["b.txt"], lines(0, &["yyyyyyyyyyyy"]));
        assert_eq!(posts[2]["b.txt"], lines(1, &["z"]));
    }

    #[test]
    fn test_encoded_output_not_split() {
        let mut files = FileSet::new();
        files.insert("a.txt".into(), lines(0, &["1234"]));
        files.insert(
            "b.bin".into(),
            FileOutput::Encoded(EncodedBatch {
                offset: 0,
                content: "QUJDREVGR0g=".into(),
                encoding: "base64".into(),
            }),
        );

        let posts = split_files(files, 8);
        assert_eq!(posts.len(), 2);
        assert!(posts[0].contains_key("a.txt"));
        assert!(posts[1].contains_key("b.bin"));
    }
}
