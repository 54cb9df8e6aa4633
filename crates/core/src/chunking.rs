use crate::error::IngestError;
use crate::models::{DocumentChunk, RelayConfig};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Split levels tried in order, coarsest first. Each level keeps its
/// separator on the left piece, so pieces tile the text they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Paragraph,
    Line,
    Sentence,
    Word,
}

const LEVELS: [Level; 4] = [Level::Paragraph, Level::Line, Level::Sentence, Level::Word];

impl Level {
    fn occurs_in(self, text: &str) -> bool {
        match self {
            Self::Paragraph => text.contains("\n\n"),
            Self::Line => text.contains('\n'),
            Self::Sentence => text.contains(". "),
            Self::Word => text.contains(char::is_whitespace),
        }
    }

    fn pieces(self, text: &str) -> Vec<&str> {
        match self {
            Self::Paragraph => text.split_inclusive("\n\n").collect(),
            Self::Line => text.split_inclusive('\n').collect(),
            Self::Sentence => text.split_inclusive(". ").collect(),
            Self::Word => text.split_inclusive(char::is_whitespace).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 512,
            overlap_chars: 0,
        }
    }
}

impl From<&RelayConfig> for ChunkingConfig {
    fn from(value: &RelayConfig) -> Self {
        Self {
            max_chars: value.chunk_size,
            overlap_chars: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Recursive character splitter.
///
/// Text is cut on the coarsest level it contains (paragraph, line, sentence,
/// whitespace); pieces that still exceed `max_chars` are cut again on the next
/// finer level. Adjacent small pieces are merged back up to the limit. Every
/// chunk is a trimmed substring of the input, and only a single token with no
/// whitespace in it may exceed the limit.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &LEVELS)
    }

    /// Splits `text` and wraps every piece as a [`DocumentChunk`], numbered in
    /// emission order.
    pub fn chunk_document(&self, source_id: &str, text: &str) -> Vec<DocumentChunk> {
        self.split_text(text)
            .into_iter()
            .enumerate()
            .map(|(ordinal, text)| DocumentChunk {
                source_id: source_id.to_string(),
                ordinal: ordinal as u64,
                content_hash: content_hash(&text),
                text,
            })
            .collect()
    }

    fn split_recursive(&self, text: &str, levels: &[Level]) -> Vec<String> {
        let Some(position) = levels.iter().position(|level| level.occurs_in(text)) else {
            let trimmed = text.trim();
            return if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            };
        };

        let finer = &levels[position + 1..];
        let mut chunks = Vec::new();
        let mut pending: Vec<(usize, usize)> = Vec::new();
        let mut offset = 0usize;

        for piece in levels[position].pieces(text) {
            let span = (offset, offset + piece.len());
            offset = span.1;

            if char_len(piece.trim()) <= self.config.max_chars {
                pending.push(span);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge(text, &pending));
                pending.clear();
            }

            let piece = piece.trim();
            if finer.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_recursive(piece, finer));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge(text, &pending));
        }

        chunks
    }

    /// Merges contiguous `pieces` (byte spans of `text`) into chunks of at most
    /// `max_chars`, carrying up to `overlap_chars` of trailing pieces forward.
    fn merge(&self, text: &str, pieces: &[(usize, usize)]) -> Vec<String> {
        let max = self.config.max_chars;
        let overlap = self.config.overlap_chars;
        let span_len = |start: usize, end: usize| char_len(text[start..end].trim());

        let mut chunks = Vec::new();
        let mut window: VecDeque<(usize, usize)> = VecDeque::new();

        for &(start, end) in pieces {
            if let Some(&(first, _)) = window.front() {
                if span_len(first, end) > max {
                    let last = window.back().map_or(end, |&(_, last)| last);
                    push_trimmed(&mut chunks, &text[first..last]);

                    while let Some(&(front, _)) = window.front() {
                        if span_len(front, last) > overlap || span_len(front, end) > max {
                            window.pop_front();
                        } else {
                            break;
                        }
                    }
                }
            }
            window.push_back((start, end));
        }

        if let (Some(&(first, _)), Some(&(_, last))) = (window.front(), window.back()) {
            push_trimmed(&mut chunks, &text[first..last]);
        }
        chunks
    }
}

fn push_trimmed(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Splits with no overlap at the given size.
pub fn split(
    source_id: &str,
    text: &str,
    max_chunk_size: usize,
) -> Result<Vec<DocumentChunk>, IngestError> {
    let chunker = Chunker::new(ChunkingConfig {
        max_chars: max_chunk_size,
        overlap_chars: 0,
    })?;
    Ok(chunker.chunk_document(source_id, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_chars: usize, overlap_chars: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            max_chars,
            overlap_chars,
        })
        .expect("valid config")
    }

    #[test]
    fn config_rejects_overlap_at_or_above_max() {
        let error = Chunker::new(ChunkingConfig {
            max_chars: 10,
            overlap_chars: 10,
        })
        .expect_err("overlap must be smaller");
        assert!(matches!(error, IngestError::InvalidChunkConfig(_)));
        assert!(Chunker::new(ChunkingConfig {
            max_chars: 0,
            overlap_chars: 0
        })
        .is_err());
    }

    #[test]
    fn words_merge_up_to_the_limit() {
        assert_eq!(
            chunker(10, 0).split_text("aaa bbb ccc ddd"),
            vec!["aaa bbb", "ccc ddd"]
        );
    }

    #[test]
    fn overlap_carries_trailing_words() {
        assert_eq!(
            chunker(10, 5).split_text("aaa bbb ccc ddd"),
            vec!["aaa bbb", "bbb ccc", "ccc ddd"]
        );
    }

    #[test]
    fn paragraphs_are_preferred_boundaries() {
        let text = "First paragraph here.\n\nSecond paragraph here.";
        assert_eq!(
            chunker(30, 0).split_text(text),
            vec!["First paragraph here.", "Second paragraph here."]
        );
        assert_eq!(chunker(100, 0).split_text(text), vec![text]);
    }

    #[test]
    fn long_word_passes_through_unsplit() {
        let word = "x".repeat(25);
        let text = format!("short {word} tail");
        let chunks = chunker(10, 0).split_text(&text);
        assert_eq!(chunks, vec!["short".to_string(), word, "tail".to_string()]);
    }

    #[test]
    fn no_chunk_exceeds_limit_except_long_words() {
        let text = "Lambda polls the queue. It scales up to 300 instances per minute. \
                    Batches are delivered to the function.\n\nErrors return messages to the queue.";
        for chunk in chunker(40, 0).split_text(text) {
            assert!(
                chunk.chars().count() <= 40 || !chunk.contains(char::is_whitespace),
                "chunk too long: {chunk:?}"
            );
        }
    }

    #[test]
    fn any_whitespace_is_a_word_boundary() {
        let chunks = split("doc", "aaaa\tbbbb\tcccc\u{a0}dddd", 5).expect("valid size");
        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        assert_eq!(texts, vec!["aaaa", "bbbb", "cccc", "dddd"]);
    }

    #[test]
    fn sentence_splits_keep_their_punctuation() {
        let text = "First sentence is long here. Second sentence is long too.";
        assert_eq!(
            chunker(30, 0).split_text(text),
            vec!["First sentence is long here.", "Second sentence is long too."]
        );
    }

    #[test]
    fn chunks_are_substrings_of_the_source() {
        let text = "Lambda polls the queue.  It scales up to 300 instances per minute. \
                    Batches\tare delivered to the function.\n\nErrors return messages. Done.";
        for (max, overlap) in [(12, 0), (25, 8), (40, 0), (80, 20)] {
            for chunk in chunker(max, overlap).split_text(text) {
                assert!(text.contains(&chunk), "not a substring: {chunk:?}");
                assert!(
                    chunk.chars().count() <= max || !chunk.contains(char::is_whitespace),
                    "chunk too long: {chunk:?}"
                );
            }
        }
    }

    #[test]
    fn chunking_is_deterministic_with_ordinals_and_hashes() {
        let text = "one two three four five six seven eight nine ten";
        let first = split("doc", text, 12).expect("valid size");
        let second = split("doc", text, 12).expect("valid size");
        assert_eq!(first, second);

        for (index, chunk) in first.iter().enumerate() {
            assert_eq!(chunk.ordinal, index as u64);
            assert_eq!(chunk.source_id, "doc");
            assert_eq!(chunk.content_hash, content_hash(&chunk.text));
        }
    }

    #[test]
    fn blank_text_yields_no_chunks() {
        assert!(chunker(10, 0).split_text("  \n\n \n").is_empty());
    }

    #[test]
    fn sizes_count_characters_not_bytes() {
        let text = "ééééé ééééé";
        assert_eq!(chunker(11, 0).split_text(text), vec![text]);
    }
}
