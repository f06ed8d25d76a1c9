use std::time::Duration;

use async_stream::stream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::llm::TokenStream;

/// Split `text` into words, keeping each trailing whitespace run attached so
/// that concatenating the pieces reproduces `text` exactly.
pub fn split_words(text: &str) -> Vec<String> {
    text.split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect()
}

/// Replay a complete reply word by word with a fixed delay between words, so
/// non-streaming backends look like streaming ones to the caller.
pub fn typing_effect(text: String, delay: Duration, cancel: CancellationToken) -> TokenStream {
    Box::pin(stream! {
        for (i, word) in split_words(&text).into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    break;
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            let item: Result<String> = Ok(word);
            yield item;
        }
    })
}
