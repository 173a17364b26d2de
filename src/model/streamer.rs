use std::sync::Arc;

use tracing::warn;

use crate::model::{DecodeOptions, TextTokenizer, TokenSink};
use crate::processing::FragmentSender;

/// Incremental detokenizer feeding the fragment pipe.
///
/// Text is flushed at word boundaries so a fragment never ends inside a
/// word that later tokens could still change. A newline flushes everything
/// and restarts the cache.
pub struct TextStreamer {
    tokenizer: Arc<dyn TextTokenizer>,
    options: DecodeOptions,
    token_cache: Vec<u32>,
    print_len: usize,
    sender: FragmentSender,
}

impl TextStreamer {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>, options: DecodeOptions, sender: FragmentSender) -> Self {
        Self {
            tokenizer,
            options,
            token_cache: Vec::new(),
            print_len: 0,
            sender,
        }
    }

    fn decode_cache(&self) -> Option<String> {
        match self.tokenizer.decode(&self.token_cache, self.options) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(error = %err, "Dropping undecodable tokens from stream");
                None
            }
        }
    }

    fn emit(&self, fragment: &str) {
        if !fragment.is_empty() {
            self.sender.send(fragment);
        }
    }
}

impl TokenSink for TextStreamer {
    fn put(&mut self, ids: &[u32]) {
        self.token_cache.extend_from_slice(ids);
        let Some(text) = self.decode_cache() else {
            return;
        };

        if text.ends_with('\n') {
            self.emit(text.get(self.print_len..).unwrap_or_default());
            self.token_cache.clear();
            self.print_len = 0;
        } else if text.chars().last().is_some_and(is_cjk) {
            if let Some(printable) = text.get(self.print_len..) {
                self.emit(printable);
                self.print_len = text.len();
            }
        } else {
            let boundary = text.rfind(' ').map_or(0, |at| at + 1);
            if let Some(printable) = text.get(self.print_len..boundary) {
                self.emit(printable);
                self.print_len = boundary;
            }
        }
    }

    fn end(&mut self) {
        if !self.token_cache.is_empty() {
            if let Some(text) = self.decode_cache() {
                self.emit(text.get(self.print_len..).unwrap_or_default());
            }
            self.token_cache.clear();
            self.print_len = 0;
        }
        self.sender.end();
    }

    fn is_cancelled(&self) -> bool {
        self.sender.is_cancelled()
    }
}

impl Drop for TextStreamer {
    fn drop(&mut self) {
        self.end();
    }
}

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
            | 0xF900..=0xFAFF
            | 0x2F800..=0x2FA1F
    )
}
