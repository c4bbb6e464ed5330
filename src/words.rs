//! Word tokenizer
//!
//! A word is a maximal run of ASCII letters, lowercased. Everything else
//! separates words. Words longer than `MAX_WORD_LEN` are split.

use std::io::{self, BufRead};

use crate::constants::MAX_WORD_LEN;

/// Iterator over the words of a buffered reader
pub struct Words<R> {
    reader: R,
    word: Vec<u8>,
}

impl<R: BufRead> Words<R> {
    /// Tokenize `reader`
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            word: Vec::with_capacity(64),
        }
    }

    fn take(&mut self) -> String {
        // Only ASCII letters are ever pushed.
        std::mem::take(&mut self.word)
            .into_iter()
            .map(char::from)
            .collect()
    }
}

impl<R: BufRead> Iterator for Words<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Some(Err(err)),
            };
            if buf.is_empty() {
                return if self.word.is_empty() {
                    None
                } else {
                    Some(Ok(self.take()))
                };
            }

            let mut consumed = 0;
            let mut complete = false;
            for &byte in buf {
                consumed += 1;
                if byte.is_ascii_alphabetic() {
                    self.word.push(byte.to_ascii_lowercase());
                    // A full piece ends here; the next letter starts a new
                    // piece rather than being dropped.
                    if self.word.len() == MAX_WORD_LEN {
                        complete = true;
                        break;
                    }
                } else if !self.word.is_empty() {
                    complete = true;
                    break;
                }
            }
            self.reader.consume(consumed);

            if complete {
                return Some(Ok(self.take()));
            }
        }
    }
}

/// Tokenize `reader` into words
pub fn words<R: BufRead>(reader: R) -> Words<R> {
    Words::new(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    fn collect(input: &[u8]) -> Vec<String> {
        words(Cursor::new(input.to_vec()))
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_splits_on_non_letters() {
        assert_eq!(collect(b"a a b a"), vec!["a", "a", "b", "a"]);
        assert_eq!(
            collect(b"don't stop-me, now!42times"),
            vec!["don", "t", "stop", "me", "now", "times"]
        );
    }

    #[test]
    fn test_lowercases() {
        assert_eq!(collect(b"The THE the"), vec!["the", "the", "the"]);
    }

    #[test]
    fn test_empty_and_separator_only_input() {
        assert!(collect(b"").is_empty());
        assert!(collect(b" \n\t123 ,.;").is_empty());
    }

    #[test]
    fn test_last_word_without_separator() {
        assert_eq!(collect(b"end"), vec!["end"]);
    }

    #[test]
    fn test_non_utf8_bytes_separate_words() {
        assert_eq!(collect(b"caf\xc3\xa9 ok\xff\xfeyes"), vec!["caf", "ok", "yes"]);
    }

    #[test]
    fn test_long_word_is_split() {
        let input = vec![b'q'; MAX_WORD_LEN + 10];
        let out = collect(&input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), MAX_WORD_LEN);
        assert_eq!(out[1].len(), 10);
    }

    #[test]
    fn test_words_span_buffer_boundaries() {
        let reader = BufReader::with_capacity(3, Cursor::new(b"abcdefg hij".to_vec()));
        let out = words(reader).collect::<io::Result<Vec<_>>>().unwrap();
        assert_eq!(out, vec!["abcdefg", "hij"]);
    }
}
