// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chunking policy.
//!
//! Text is split into retrieval units of roughly `target_chars`, preferring
//! paragraph boundaries, then sentence boundaries, then whitespace.  Fenced
//! code blocks are never split across chunks, consecutive chunks share an
//! `overlap_chars` tail, and runts shorter than `min_chars` are merged into
//! the preceding chunk.  All splitting happens on `char` boundaries, so a
//! multi-byte character can never be torn apart.

#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    pub target_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            target_chars: 1000,
            overlap_chars: 200,
            min_chars: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub text: String,
    /// Markdown heading in effect where this chunk begins.
    pub section: Option<String>,
}

/// One paragraph-level block with the heading context it appeared under.
struct Block {
    text: String,
    section: Option<String>,
}

/// Split `text` according to `policy`.
pub fn chunk_text(text: &str, policy: &ChunkPolicy) -> Vec<ChunkDraft> {
    let blocks = split_blocks(text);
    let mut out: Vec<ChunkDraft> = Vec::new();
    let mut current = String::new();
    let mut current_section: Option<String> = None;

    let mut flush = |current: &mut String, section: &mut Option<String>, out: &mut Vec<ChunkDraft>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            out.push(ChunkDraft {
                text: trimmed.to_string(),
                section: section.clone(),
            });
        }
        current.clear();
    };

    for block in blocks {
        for piece in split_oversized(&block.text, policy.target_chars) {
            let candidate_len = if current.is_empty() {
                piece.chars().count()
            } else {
                current.chars().count() + 2 + piece.chars().count()
            };
            if !current.is_empty() && candidate_len > policy.target_chars {
                flush(&mut current, &mut current_section, &mut out);
                // Seed the next chunk with the previous chunk's tail for
                // continuity across the boundary.
                if policy.overlap_chars > 0 {
                    if let Some(prev) = out.last() {
                        current = tail_chars(&prev.text, policy.overlap_chars)
                            .trim_start()
                            .to_string();
                    }
                }
            }
            if current.trim().is_empty() {
                current_section = block.section.clone();
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }
    flush(&mut current, &mut current_section, &mut out);

    merge_runts(out, policy.min_chars)
}

/// Split into paragraph blocks on blank lines, keeping fenced code blocks
/// intact and tracking the current markdown heading.
fn split_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut section: Option<String> = None;
    let mut current_section: Option<String> = None;
    let mut in_fence = false;

    let mut push = |buf: &mut String, sec: &Option<String>, blocks: &mut Vec<Block>| {
        if !buf.trim().is_empty() {
            blocks.push(Block {
                text: buf.trim_end().to_string(),
                section: sec.clone(),
            });
        }
        buf.clear();
    };

    for line in text.lines() {
        let fence_marker = line.trim_start().starts_with("```");
        if fence_marker {
            in_fence = !in_fence;
        }
        if !in_fence && !fence_marker && line.trim().is_empty() {
            push(&mut current, &current_section, &mut blocks);
            continue;
        }
        if !in_fence {
            if let Some(heading) = line.trim().strip_prefix('#') {
                section = Some(heading.trim_start_matches('#').trim().to_string());
            }
        }
        if current.is_empty() {
            current_section = section.clone();
        }
        current.push_str(line);
        current.push('\n');
    }
    push(&mut current, &current_section, &mut blocks);
    blocks
}

/// Break a block that exceeds `target` into pieces of at most `target`
/// characters: sentences first, whitespace second, hard char split last.
/// Fenced code blocks pass through whole regardless of size.
fn split_oversized(text: &str, target: usize) -> Vec<String> {
    if text.chars().count() <= target || text.trim_start().starts_with("```") {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(text) {
        let sentence_len = sentence.chars().count();
        if current.chars().count() + sentence_len > target && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        if sentence_len > target {
            if !current.trim().is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            // Whitespace fallback, then a hard split for unbroken runs.
            for word_piece in split_whitespace_bounded(&sentence, target) {
                pieces.push(word_piece);
            }
        } else {
            current.push_str(&sentence);
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Split on sentence terminators followed by whitespace, keeping the
/// terminator with the sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '\n') {
            if chars.peek().map(|n| n.is_whitespace()).unwrap_or(true) {
                out.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Pack whitespace-separated words into pieces of at most `target` chars;
/// a single run longer than `target` is hard-split on char boundaries.
fn split_whitespace_bounded(text: &str, target: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in text.split_inclusive(char::is_whitespace) {
        let word_len = word.chars().count();
        if current.chars().count() + word_len > target && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if word_len > target {
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(target) {
                out.push(piece.iter().collect());
            }
        } else {
            current.push_str(word);
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Last `n` characters of `s`, on a char boundary.
fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

/// Merge chunks shorter than `min_chars` into their predecessor.
fn merge_runts(chunks: Vec<ChunkDraft>, min_chars: usize) -> Vec<ChunkDraft> {
    let mut out: Vec<ChunkDraft> = Vec::new();
    for chunk in chunks {
        if chunk.text.chars().count() < min_chars {
            if let Some(prev) = out.last_mut() {
                prev.text.push_str("\n\n");
                prev.text.push_str(&chunk.text);
                continue;
            }
        }
        out.push(chunk);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(target: usize, overlap: usize, min: usize) -> ChunkPolicy {
        ChunkPolicy {
            target_chars: target,
            overlap_chars: overlap,
            min_chars: min,
        }
    }

    fn para(n: usize, len: usize) -> String {
        let word = format!("p{n}word ");
        let mut s = String::new();
        while s.chars().count() < len {
            s.push_str(&word);
        }
        s.truncate(len);
        s
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello world, this is a short note", &policy(1000, 200, 5));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn paragraphs_pack_up_to_target() {
        let text = format!("{}\n\n{}\n\n{}", para(1, 400), para(2, 400), para(3, 400));
        let chunks = chunk_text(&text, &policy(1000, 0, 50));
        // 400 + 2 + 400 fits; the third paragraph starts a new chunk.
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn chunk_count_scales_with_text_length() {
        let paras: Vec<String> = (0..12).map(|i| para(i, 980)).collect();
        let text = paras.join("\n\n");
        let chunks = chunk_text(&text, &policy(1000, 200, 50));
        assert_eq!(chunks.len(), 12);
    }

    #[test]
    fn overlap_repeats_previous_tail() {
        let text = format!("{}\n\n{}", para(1, 900), para(2, 900));
        let chunks = chunk_text(&text, &policy(1000, 100, 50));
        assert_eq!(chunks.len(), 2);
        let tail: String = chunks[0].text.chars().skip(chunks[0].text.chars().count() - 100).collect();
        assert!(chunks[1].text.starts_with(&tail));
    }

    #[test]
    fn oversized_paragraph_splits_at_sentences() {
        let sentence = "This sentence is exactly forty chars!!! ";
        let text = sentence.repeat(10); // one 400-char paragraph, no blank lines
        let chunks = chunk_text(&text, &policy(100, 0, 10));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 110, "chunk too long: {}", c.text.len());
        }
    }

    #[test]
    fn unbroken_run_falls_back_to_hard_split() {
        let text = "x".repeat(350);
        let chunks = chunk_text(&text, &policy(100, 0, 10));
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().take(3).all(|c| c.text.chars().count() == 100));
    }

    #[test]
    fn multibyte_text_is_never_torn() {
        let text = "héllö wörld ".repeat(200);
        let chunks = chunk_text(&text, &policy(100, 20, 10));
        for c in &chunks {
            // Would panic at construction if a char had been split; verify
            // round-trip integrity instead.
            assert!(c.text.is_char_boundary(0));
            assert!(std::str::from_utf8(c.text.as_bytes()).is_ok());
        }
    }

    #[test]
    fn code_fences_stay_intact() {
        let fence = "```rust\nfn main() {\n\n    println!(\"hi\");\n\n}\n```";
        let text = format!("{}\n\n{}\n\n{}", para(1, 400), fence, para(2, 400));
        let chunks = chunk_text(&text, &policy(300, 0, 10));
        let holder = chunks
            .iter()
            .find(|c| c.text.contains("```rust"))
            .expect("fence retained");
        assert!(
            holder.text.contains("```rust") && holder.text.matches("```").count() == 2,
            "fence split across chunks"
        );
    }

    #[test]
    fn runts_merge_into_previous_chunk() {
        let text = format!("{}\n\ntiny", para(1, 990));
        let chunks = chunk_text(&text, &policy(1000, 0, 50));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.ends_with("tiny"));
    }

    #[test]
    fn markdown_heading_becomes_section_metadata() {
        let text = format!(
            "# Introduction\n\n{}\n\n## Methods\n\n{}",
            para(1, 900),
            para(2, 900)
        );
        let chunks = chunk_text(&text, &policy(1000, 0, 10));
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].section.as_deref(), Some("Introduction"));
        assert_eq!(chunks.last().unwrap().section.as_deref(), Some("Methods"));
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = format!("{}\n\n{}\n\n{}", para(1, 700), para(2, 700), para(3, 700));
        let p = policy(1000, 200, 50);
        assert_eq!(chunk_text(&text, &p), chunk_text(&text, &p));
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", &ChunkPolicy::default()).is_empty());
        assert!(chunk_text("\n\n  \n", &ChunkPolicy::default()).is_empty());
    }
}
