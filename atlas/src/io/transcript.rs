//! Live, human-readable transcript channel.
//!
//! Lines reach the transcript as steps produce them. The final structured
//! result never goes through here; see [`result_protocol`](crate::io::result_protocol).

use std::io::{self, Write};

use tracing::warn;

use crate::io::result_protocol::sanitize_transcript_line;

/// Sink for transcript lines.
pub trait Transcript {
    fn line(&mut self, line: &str);
}

/// Emit a `--- message ---` section header.
pub fn banner(transcript: &mut dyn Transcript, message: &str) {
    transcript.line(&format!("--- {message} ---"));
}

/// Collects lines in memory.
impl Transcript for Vec<String> {
    fn line(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullTranscript;

impl Transcript for NullTranscript {
    fn line(&mut self, _line: &str) {}
}

/// Writes each line to a writer (stdout in the CLI), flushing per line so
/// observers see progress in real time. Lines that would collide with the
/// result marker are escaped.
pub struct WriterTranscript<W: Write> {
    writer: W,
    failed: bool,
}

impl<W: Write> WriterTranscript<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl WriterTranscript<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> Transcript for WriterTranscript<W> {
    fn line(&mut self, line: &str) {
        if self.failed {
            return;
        }
        let safe = sanitize_transcript_line(line);
        let written = writeln!(self.writer, "{safe}").and_then(|()| self.writer.flush());
        if let Err(err) = written {
            // A closed stdout must not abort the pipeline; cleanup still runs.
            warn!(err = %err, "transcript write failed; suppressing further lines");
            self.failed = true;
        }
    }
}
