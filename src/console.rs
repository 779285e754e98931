use async_trait::async_trait;
use futures::StreamExt;
use std::error::Error;
use tokio::io::{ self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout };

use crate::llm::generation::TextStream;

/// Turns cumulative snapshots into whole words that are safe to print.
///
/// The last word of a snapshot may still grow, so it is held back until a
/// later snapshot shows a word after it.
#[derive(Debug, Default)]
pub struct WordStreamer {
    skip_echo_len: usize,
    printed: usize,
    words: Vec<String>,
}

impl WordStreamer {
    pub fn new(skip_echo_len: usize) -> Self {
        Self { skip_echo_len, printed: 0, words: Vec::new() }
    }

    /// Newly stable words followed by a space, if any.
    pub fn push(&mut self, snapshot: &str) -> Option<String> {
        let visible: String = snapshot.chars().skip(self.skip_echo_len).collect();
        self.words = visible
            .trim()
            .split(' ')
            .map(str::to_string)
            .collect();
        let stable = self.words.len() - 1;
        if stable > self.printed {
            let chunk = format!("{} ", self.words[self.printed..stable].join(" "));
            self.printed = stable;
            return Some(chunk);
        }
        None
    }

    /// Returns the unprinted tail and the full text.
    pub fn finish(self) -> (String, String) {
        let tail = self.words
            .get(self.printed..)
            .map(|rest| rest.join(" "))
            .unwrap_or_default();
        (tail, self.words.join(" "))
    }
}

#[async_trait]
pub trait ChatIo: Send {
    /// Reads one line after printing `role: `; end of input yields an empty string.
    async fn prompt_for_input(&mut self, role: &str) -> Result<String, Box<dyn Error + Send + Sync>>;

    async fn prompt_for_output(&mut self, role: &str) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Prints words as they stabilize and returns the final text with the echo removed.
    async fn stream_output(
        &mut self,
        stream: TextStream,
        skip_echo_len: usize
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    async fn notify(&mut self, message: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}

pub struct ConsoleChatIo<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> ConsoleChatIo<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

impl ConsoleChatIo<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R, W> ConsoleChatIo<R, W> where W: AsyncWrite + Unpin + Send {
    async fn write_flush(&mut self, text: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> ChatIo
    for ConsoleChatIo<R, W>
    where R: AsyncBufRead + Unpin + Send, W: AsyncWrite + Unpin + Send
{
    async fn prompt_for_input(&mut self, role: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.write_flush(&format!("{}: ", role)).await?;
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(String::new());
        }
        let trimmed_len = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed_len);
        Ok(line)
    }

    async fn prompt_for_output(&mut self, role: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.write_flush(&format!("{}: ", role)).await
    }

    async fn stream_output(
        &mut self,
        mut stream: TextStream,
        skip_echo_len: usize
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let mut streamer = WordStreamer::new(skip_echo_len);
        while let Some(snapshot) = stream.next().await {
            if let Some(chunk) = streamer.push(&snapshot?) {
                self.write_flush(&chunk).await?;
            }
        }
        let (tail, full) = streamer.finish();
        self.write_flush(&format!("{}\n", tail)).await?;
        Ok(full)
    }

    async fn notify(&mut self, message: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.write_flush(&format!("{}\n", message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn snapshots(items: &[&str]) -> TextStream {
        let owned: Vec<Result<String, Box<dyn Error + Send + Sync>>> = items
            .iter()
            .map(|s| Ok(s.to_string()))
            .collect();
        Box::pin(stream::iter(owned))
    }

    #[test]
    fn streamer_prints_only_completed_words() {
        let mut streamer = WordStreamer::new(0);
        assert_eq!(streamer.push("The"), None);
        assert_eq!(streamer.push("The quick").as_deref(), Some("The "));
        assert_eq!(streamer.push("The quick brown").as_deref(), Some("quick "));
        assert_eq!(streamer.finish(), ("brown".to_string(), "The quick brown".to_string()));
    }

    #[test]
    fn streamer_skips_echoed_prompt() {
        let prompt = "Human: hi###Assistant:";
        let mut streamer = WordStreamer::new(prompt.len() + 1);
        assert_eq!(streamer.push(&format!("{} let", prompt)), None);
        assert_eq!(streamer.push(&format!("{} let x = 1;", prompt)).as_deref(), Some("let x = "));
        assert_eq!(streamer.finish().1, "let x = 1;");
    }

    #[test]
    fn streamer_handles_snapshots_shorter_than_echo() {
        let mut streamer = WordStreamer::new(100);
        assert_eq!(streamer.push("short"), None);
        assert_eq!(streamer.finish(), (String::new(), String::new()));
    }

    #[test]
    fn streamer_survives_shrinking_snapshot() {
        let mut streamer = WordStreamer::new(0);
        streamer.push("a b c d");
        streamer.push("a b");
        assert_eq!(streamer.finish(), (String::new(), "a b".to_string()));
    }

    #[tokio::test]
    async fn stream_output_writes_incrementally() {
        let mut io = ConsoleChatIo::new(&b""[..], Vec::new());
        let full = io
            .stream_output(snapshots(&["The", "The quick", "The quick brown"]), 0).await
            .unwrap();
        assert_eq!(full, "The quick brown");
        assert_eq!(String::from_utf8(io.into_writer()).unwrap(), "The quick brown\n");
    }

    #[tokio::test]
    async fn stream_errors_propagate() {
        let items: Vec<Result<String, Box<dyn Error + Send + Sync>>> = vec![
            Ok("a b".to_string()),
            Err("model failed".into())
        ];
        let mut io = ConsoleChatIo::new(&b""[..], Vec::new());
        let err = io.stream_output(Box::pin(stream::iter(items)), 0).await.unwrap_err();
        assert_eq!(err.to_string(), "model failed");
    }

    #[tokio::test]
    async fn input_strips_newline_and_eof_is_empty() {
        let mut io = ConsoleChatIo::new(&b"list buckets\r\n"[..], Vec::new());
        assert_eq!(io.prompt_for_input("Human").await.unwrap(), "list buckets");
        assert_eq!(io.prompt_for_input("Human").await.unwrap(), "");
        assert_eq!(String::from_utf8(io.into_writer()).unwrap(), "Human: Human: ");
    }
}
