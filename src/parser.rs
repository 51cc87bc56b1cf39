//! The wire parser (spec §4.1): a pure byte-in/lines-or-chunks-out
//! transformation with two mutually exclusive modes. Owned exclusively by
//! its `ConnectionContext`; never shared.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    Data,
}

/// Signals the end of a DATA body: the total unescaped byte count and
/// whether it exceeded the configured maximum (spec: "the byte count passed
/// to `onEnd` is the sum of unescaped bytes emitted").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEnd {
    pub byte_count: u64,
    pub size_exceeded: bool,
}

/// The result of feeding one chunk to the parser while in data mode.
#[derive(Debug, Default)]
pub struct DataFeedResult {
    /// Unstuffed body bytes, in order, ready to be appended to the body
    /// stream.
    pub chunks: Vec<Vec<u8>>,
    /// Present iff the terminator `\r\n.\r\n` was found in this feed.
    pub end: Option<DataEnd>,
    /// Bytes pipelined immediately after the terminator, to be re-queued as
    /// the start of the next command-mode feed.
    pub remainder: Option<Vec<u8>>,
}

/// Converts raw inbound bytes into SMTP command lines (command mode) or an
/// unstuffed DATA body (data mode). See spec §4.1 for the exact algorithm.
pub struct WireParser {
    mode: Mode,
    command_tail: Vec<u8>,
    data_tail: Vec<u8>,
    data_started: bool,
    byte_count: u64,
    max_bytes: u64,
    closed: bool,
}

impl Default for WireParser {
    fn default() -> Self {
        WireParser {
            mode: Mode::Command,
            command_tail: Vec::new(),
            data_tail: Vec::new(),
            data_started: false,
            byte_count: 0,
            max_bytes: u64::MAX,
            closed: false,
        }
    }
}

impl WireParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_data_mode(&self) -> bool {
        self.mode == Mode::Data
    }

    /// Splits `chunk` on `\n`, stripping a preceding `\r`, returning every
    /// line completed so far. Incomplete trailing bytes are retained. A
    /// no-op while in data mode or after the parser has been closed.
    pub fn feed_command_mode(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.closed || self.mode == Mode::Data {
            return Vec::new();
        }
        self.command_tail.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.command_tail.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.command_tail.drain(..=pos).collect();
            line.pop(); // the '\n' itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Switches to data mode. Returns any unflushed command-mode tail, which
    /// the caller must immediately pass to [`feed_data_mode`](Self::feed_data_mode)
    /// — a rare but real case when `DATA\r\n` and the first body bytes
    /// arrive in the same packet.
    pub fn start_data_mode(&mut self, max_bytes: Option<u64>) -> Vec<u8> {
        self.mode = Mode::Data;
        self.byte_count = 0;
        self.max_bytes = max_bytes.unwrap_or(u64::MAX);
        self.data_tail.clear();
        self.data_started = false;
        std::mem::take(&mut self.command_tail)
    }

    /// Runs the dot-unstuffing algorithm over `chunk` (see spec §4.1). A
    /// no-op while in command mode or after the parser has been closed.
    pub fn feed_data_mode(&mut self, chunk: &[u8]) -> DataFeedResult {
        let mut result = DataFeedResult::default();
        if self.closed || self.mode == Mode::Command {
            return result;
        }

        let mut buf = std::mem::take(&mut self.data_tail);
        buf.extend_from_slice(chunk);
        if buf.is_empty() {
            return result;
        }

        let len = buf.len();
        let mut start = 0usize;

        if !self.data_started {
            self.data_started = true;
            if len >= 3 && &buf[0..3] == b".\r\n" {
                self.mode = Mode::Command;
                result.end = Some(DataEnd {
                    byte_count: self.byte_count,
                    size_exceeded: self.byte_count > self.max_bytes,
                });
                if len > 3 {
                    result.remainder = Some(buf[3..].to_vec());
                }
                return result;
            }
            if len >= 2 && &buf[0..2] == b".." {
                start = 1;
            }
        }

        let mut i = start + 2;
        while i < len {
            if buf[i] == b'.' && buf[i - 1] == b'\n' {
                if i + 3 <= len && &buf[i - 2..i + 3] == b"\r\n.\r\n" {
                    result.chunks.push(buf[start..i].to_vec());
                    self.byte_count += (i - start) as u64;
                    self.mode = Mode::Command;
                    result.end = Some(DataEnd {
                        byte_count: self.byte_count,
                        size_exceeded: self.byte_count > self.max_bytes,
                    });
                    let remainder_start = i + 3;
                    if remainder_start < len {
                        result.remainder = Some(buf[remainder_start..].to_vec());
                    }
                    return result;
                } else if i + 1 < len && buf[i + 1] == b'.' {
                    result.chunks.push(buf[start..i].to_vec());
                    self.byte_count += (i - start) as u64;
                    start = i + 1;
                    i = start + 2;
                    continue;
                }
            }
            i += 1;
        }

        // Neither terminator nor escape found: keep the last 4 bytes (the
        // maximum lookback/lookahead `\r\n.\r\n` detection needs) and emit
        // the rest.
        let keep = 4usize.min(len - start);
        let emit_end = len - keep;
        if emit_end > start {
            result.chunks.push(buf[start..emit_end].to_vec());
            self.byte_count += (emit_end - start) as u64;
        }
        self.data_tail = buf[emit_end..].to_vec();

        result
    }

    /// Called on socket close: returns the unterminated command-mode
    /// remainder (if any) as a final line, and marks the parser closed so
    /// subsequent feeds are no-ops.
    pub fn flush(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        self.closed = true;
        if self.mode == Mode::Command && !self.command_tail.is_empty() {
            let mut line = std::mem::take(&mut self.command_tail);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Some(String::from_utf8_lossy(&line).into_owned())
        } else {
            None
        }
    }
}
