//! Buffered pipe I/O for worker communication.
//!
//! Provides line-based I/O over pipes with EINTR handling and a
//! `poll(2)`-bounded read so callers can re-check worker liveness
//! instead of blocking forever. A line is only delivered once its `\n`
//! has arrived: bytes left unterminated when the writer goes away read as
//! EOF, since they are what a process dying mid-write leaves behind.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

/// Capacity of the pipe buffers on both sides.
const PIPE_BUFFER: usize = 64 * 1024;

/// One end of an anonymous pipe.
#[derive(Debug)]
pub struct PipeFd(OwnedFd);

/// Run a raw syscall, retrying while it is interrupted.
fn retry_eintr(mut op: impl FnMut() -> nix::Result<usize>) -> io::Result<usize> {
    loop {
        match op() {
            Err(Errno::EINTR) => {}
            other => return other.map_err(io::Error::from),
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::read(&self.0, buf))
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::write(&self.0, buf))
    }

    /// Unbuffered at this level.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create an anonymous pipe, returning `(read end, write end)`.
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
    Ok((PipeFd(read), PipeFd(write)))
}

/// Outcome of a bounded line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// Nothing arrived within the timeout.
    Timeout,
    /// Every write end of the pipe is closed.
    Eof,
}

/// Reads newline-terminated messages from a pipe.
#[derive(Debug)]
pub struct LineReader {
    reader: BufReader<PipeFd>,
    /// Bytes of a line whose terminator has not arrived yet.
    partial: Vec<u8>,
    line: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER, fd),
            partial: Vec::new(),
            line: String::new(),
        }
    }

    /// Block for the next line, without its terminator; `None` at EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        loop {
            let chunk = self.reader.fill_buf()?;
            if chunk.is_empty() {
                self.partial.clear();
                return Ok(None);
            }
            if let Some(end) = chunk.iter().position(|&b| b == b'\n') {
                self.partial.extend_from_slice(&chunk[..end]);
                self.reader.consume(end + 1);
                break;
            }
            let len = chunk.len();
            self.partial.extend_from_slice(chunk);
            self.reader.consume(len);
        }

        let bytes = std::mem::take(&mut self.partial);
        self.line = String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let trimmed = self.line.trim_end_matches('\r').len();
        self.line.truncate(trimmed);
        Ok(Some(&self.line))
    }

    /// Read a line, waiting at most `timeout` for more bytes to arrive.
    ///
    /// A line already sitting in the buffer is returned without polling. When
    /// only part of a line arrives it is kept for the next call and this one
    /// reports `Timeout`, so the caller never blocks on a half-written line.
    pub fn read_line_timeout(&mut self, timeout: Duration) -> io::Result<LineRead> {
        if !self.reader.buffer().contains(&b'\n') {
            self.stash_buffered();
            let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(self.reader.get_ref().as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) | Err(Errno::EINTR) => return Ok(LineRead::Timeout),
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
            let chunk = self.reader.fill_buf()?;
            if chunk.is_empty() {
                self.partial.clear();
                return Ok(LineRead::Eof);
            }
            if !chunk.contains(&b'\n') {
                self.stash_buffered();
                return Ok(LineRead::Timeout);
            }
        }
        Ok(match self.read_line()? {
            Some(line) => LineRead::Line(line.to_string()),
            None => LineRead::Eof,
        })
    }

    /// Move buffered bytes into `partial` so the next `fill_buf` reads the pipe.
    fn stash_buffered(&mut self) {
        let buffered = self.reader.buffer();
        let len = buffered.len();
        self.partial.extend_from_slice(buffered);
        self.reader.consume(len);
    }
}

/// Writes newline-terminated messages to a pipe.
#[derive(Debug)]
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER, fd),
        }
    }

    /// Write `line`, terminating it if needed, and flush it to the pipe.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_line_reader_writer_roundtrip() {
        let (read_fd, write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);

        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap();
        writer.write_line("").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some("hello"));
        assert_eq!(reader.read_line().unwrap(), Some("world"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_read_line_timeout_expires() {
        let (read_fd, _write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);

        let start = std::time::Instant::now();
        let outcome = reader.read_line_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(outcome, LineRead::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_read_line_timeout_reports_eof() {
        let (read_fd, write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);
        drop(write_fd);

        let outcome = reader.read_line_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, LineRead::Eof);
    }

    #[test]
    fn test_read_line_timeout_uses_buffered_lines() {
        let (read_fd, write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);

        // Both lines land in the reader's buffer on the first read.
        writer.write_line("first\nsecond").unwrap();

        assert_eq!(
            reader.read_line_timeout(Duration::from_secs(1)).unwrap(),
            LineRead::Line("first".into())
        );
        assert_eq!(
            reader.read_line_timeout(Duration::from_millis(10)).unwrap(),
            LineRead::Line("second".into())
        );
    }

    #[test]
    fn test_read_line_timeout_wakes_on_write() {
        let (read_fd, write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut writer = LineWriter::new(write_fd);
            writer.write_line("late").unwrap();
        });

        let outcome = reader.read_line_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, LineRead::Line("late".into()));
        writer.join().unwrap();
    }

    #[test]
    fn test_unterminated_line_reads_as_eof() {
        let (read_fd, mut write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);
        write_fd.write_all(b"complete\n{\"status\":200,\"data\":\"aaaa").unwrap();
        drop(write_fd);

        assert_eq!(reader.read_line().unwrap(), Some("complete"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_read_line_timeout_drops_truncated_line_at_eof() {
        let (read_fd, mut write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);
        write_fd.write_all(b"{\"status\":200,\"data\":\"aaaa").unwrap();

        // The partial line arrives but the caller is not kept waiting on it.
        let start = std::time::Instant::now();
        assert_eq!(
            reader.read_line_timeout(Duration::from_secs(1)).unwrap(),
            LineRead::Timeout
        );
        assert!(start.elapsed() < Duration::from_millis(500));

        drop(write_fd);
        assert_eq!(
            reader.read_line_timeout(Duration::from_secs(1)).unwrap(),
            LineRead::Eof
        );
    }

    #[test]
    fn test_line_split_across_writes() {
        let (read_fd, mut write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);

        write_fd.write_all(b"hel").unwrap();
        assert_eq!(
            reader.read_line_timeout(Duration::from_millis(200)).unwrap(),
            LineRead::Timeout
        );
        write_fd.write_all(b"lo\nnext").unwrap();
        assert_eq!(
            reader.read_line_timeout(Duration::from_millis(200)).unwrap(),
            LineRead::Line("hello".into())
        );
        write_fd.write_all(b"\n").unwrap();
        assert_eq!(reader.read_line().unwrap(), Some("next"));
    }

    #[test]
    fn test_crlf_handling() {
        let (read_fd, write_fd) = pipe().unwrap();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);

        writer.write_line("line1\r\nline2").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some("line1"));
        assert_eq!(reader.read_line().unwrap(), Some("line2"));
    }
}
