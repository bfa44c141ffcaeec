//! Header-aware, bounded-size text chunker.
//!
//! Splits a document into ordered [`Chunk`]s:
//!
//! 1. empty input → no chunks.
//! 2. split on Markdown ATX headings (`#`..`######`), if any exist; each
//!    section is tagged with its heading text.
//! 3. within each section, split on blank-line boundaries into paragraphs.
//! 4. any paragraph exceeding `max_chunk_size` is hard re-split into
//!    `target_chunk_size` windows with `overlap` bytes of trailing
//!    context repeated at the start of the next window.
//! 5. any non-final chunk shorter than `min_chunk_size` is merged into
//!    a neighbor.
//! 6. indices are assigned `0..N-1` and `total_chunks` is set to `N`.
//!
//! This generalizes the teacher's paragraph-boundary chunker with
//! heading-aware sectioning, a soft/hard size distinction, overlap on
//! hard splits, and a short-chunk merge pass.

/// Tuning knobs for [`chunk`]. Defaults match `spec.md` §4.1.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// Hard upper bound on a single chunk's byte length.
    pub max_chunk_size: usize,
    /// Soft target window size used when hard-splitting an oversized
    /// paragraph.
    pub target_chunk_size: usize,
    /// Bytes of trailing context repeated at the start of the next
    /// window during a hard split.
    pub overlap: usize,
    /// Minimum byte length for any non-final chunk; shorter chunks are
    /// merged into a neighbor.
    pub min_chunk_size: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: 1500,
            target_chunk_size: 1000,
            overlap: 100,
            min_chunk_size: 50,
        }
    }
}

/// An ordered, bounded-size span of a document carrying a header hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Ordinal position in the document, `0..total_chunks`.
    pub index: usize,
    /// Chunk body text. Never empty.
    pub text: String,
    /// Nearest preceding Markdown heading text, without the leading `#`s.
    pub header: Option<String>,
    /// Total number of chunks produced for this document.
    pub total_chunks: usize,
}

struct Draft {
    text: String,
    header: Option<String>,
}

/// Split `text` into ordered, bounded-size chunks. Deterministic and pure.
pub fn chunk(text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let normalized = text.replace("\r\n", "\n");
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let sections = split_into_sections(trimmed);

    let mut drafts: Vec<Draft> = Vec::new();
    for (header, body) in sections {
        for paragraph in split_into_paragraphs(&body) {
            if paragraph.len() > opts.max_chunk_size {
                for window in hard_split(&paragraph, opts) {
                    drafts.push(Draft {
                        text: window,
                        header: header.clone(),
                    });
                }
            } else {
                drafts.push(Draft {
                    text: paragraph,
                    header: header.clone(),
                });
            }
        }
    }

    if drafts.is_empty() {
        drafts.push(Draft {
            text: trimmed.to_string(),
            header: None,
        });
    }

    merge_short_drafts(&mut drafts, opts.min_chunk_size);

    let total = drafts.len();
    drafts
        .into_iter()
        .enumerate()
        .map(|(index, d)| Chunk {
            index,
            text: d.text,
            header: d.header,
            total_chunks: total,
        })
        .collect()
}

/// Split into `(heading, body)` sections on ATX headings. If no heading
/// line exists, returns a single section with `header = None`.
fn split_into_sections(text: &str) -> Vec<(Option<String>, String)> {
    let lines: Vec<&str> = text.lines().collect();
    let mut sections: Vec<(Option<String>, String)> = Vec::new();
    let mut current_header: Option<String> = None;
    let mut current_body = String::new();
    let mut saw_heading = false;

    for line in lines {
        if let Some(heading) = atx_heading_text(line) {
            if !current_body.trim().is_empty() || current_header.is_some() {
                sections.push((current_header.take(), current_body.trim().to_string()));
            }
            current_body.clear();
            current_header = Some(heading);
            saw_heading = true;
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    sections.push((current_header, current_body.trim().to_string()));

    if !saw_heading {
        return vec![(None, text.to_string())];
    }

    sections
        .into_iter()
        .filter(|(header, body)| header.is_some() || !body.is_empty())
        .collect()
}

/// Recognize an ATX heading line (`#`..`######` followed by a space),
/// returning the heading text with the hashes stripped.
fn atx_heading_text(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if rest.is_empty() {
        return None;
    }
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    Some(rest.trim().to_string())
}

/// Split body text into paragraphs on runs of one or more blank lines.
fn split_into_paragraphs(body: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for line in body.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                paragraphs.push(current.trim().to_string());
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    paragraphs
}

/// Hard-split an oversized paragraph into `target_chunk_size` windows,
/// repeating `overlap` bytes of trailing context at the start of the
/// next window. Window boundaries snap to the nearest UTF-8 char
/// boundary so slicing never panics.
fn hard_split(paragraph: &str, opts: &ChunkOptions) -> Vec<String> {
    let bytes_len = paragraph.len();
    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < bytes_len {
        let raw_end = (start + opts.target_chunk_size).min(bytes_len);
        let end = snap_to_char_boundary(paragraph, raw_end);
        windows.push(paragraph[start..end].to_string());

        if end >= bytes_len {
            break;
        }

        let next_start_raw = end.saturating_sub(opts.overlap);
        let next_start = snap_to_char_boundary(paragraph, next_start_raw);
        // Guarantee forward progress even if overlap >= target size.
        start = if next_start > start { next_start } else { end };
    }

    windows
}

fn snap_to_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Merge any non-final draft shorter than `min_chunk_size` into a
/// neighbor: backward into the previous draft, or forward into the next
/// one if there is no previous draft (the first draft is short).
fn merge_short_drafts(drafts: &mut Vec<Draft>, min_chunk_size: usize) {
    let mut i = 0;
    while i < drafts.len() {
        let is_last = i == drafts.len() - 1;
        if is_last || drafts[i].text.len() >= min_chunk_size {
            i += 1;
            continue;
        }

        if i == 0 {
            let cur = drafts.remove(0);
            drafts[0].text = format!("{}\n\n{}", cur.text, drafts[0].text);
            if drafts[0].header.is_none() {
                drafts[0].header = cur.header;
            }
            // re-check the merged-into draft at index 0
        } else {
            let cur = drafts.remove(i);
            drafts[i - 1].text = format!("{}\n\n{}", drafts[i - 1].text, cur.text);
            // don't advance; re-check the (possibly still short) merged draft
        }
    }
}
