//! Diagnostic output.
//!
//! Every report line is assembled in a fixed stack buffer and pushed to
//! stderr with one raw `write(2)`. Buffered stdio is banned here: glibc
//! allocates stream buffers on first use, and this code runs inside
//! intercepted allocator calls. Lines that outgrow the buffer are
//! truncated, never reallocated.

use core::fmt::{self, Write as _};

use crate::classify::{self, Provenance};
use crate::config;
use crate::registry::AllocationRecord;

/// Frames shown per report entry.
const REPORT_FRAMES: usize = 7;

const LINE_MAX: usize = 512;

struct LineBuf {
    len: usize,
    buf: [u8; LINE_MAX],
}

impl LineBuf {
    const fn new() -> Self {
        LineBuf {
            len: 0,
            buf: [0u8; LINE_MAX],
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let room = LINE_MAX - self.len;
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Write the buffered line (plus a newline) to stderr and reset.
    fn flush_line(&mut self) {
        self.push_bytes(b"\n");
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.buf.as_ptr() as *const libc::c_void,
                self.len,
            );
        }
        self.len = 0;
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// One corruption event: a release targeting an address the registry does
/// not own. `frames` is the current (already trimmed) call stack.
pub fn corruption(address: usize, frames: &[usize]) {
    let mut line = LineBuf::new();
    let _ = write!(line, "[CORRUPTION] Double-Free or Invalid-Free at {:#x}", address);
    line.flush_line();
    if config::get().stack_traces {
        for &frame in frames.iter().take(REPORT_FRAMES) {
            emit_frame(frame);
        }
    }
}

/// Tracking-storage failure: the allocation stands, the record does not.
pub fn storage_failure() {
    let mut line = LineBuf::new();
    let _ = line.write_str("[memtrace] dropping allocation record: out of memory");
    line.flush_line();
}

/// The final leak report. Caller guarantees at least one record remains.
/// User records are itemized; libc infrastructure is only counted.
pub fn leaks<'a, I>(records: I)
where
    I: IntoIterator<Item = (&'a usize, &'a AllocationRecord)>,
{
    let stack_traces = config::get().stack_traces;

    let mut user_count = 0usize;
    let mut user_bytes = 0usize;
    let mut libc_count = 0usize;
    let mut libc_bytes = 0usize;

    let mut line = LineBuf::new();
    let _ = line.write_str("========== MEMORY LEAKS ==========");
    line.flush_line();

    for (&address, record) in records {
        match record.provenance {
            Provenance::Libc => {
                libc_count += 1;
                libc_bytes = libc_bytes.saturating_add(record.size);
            }
            Provenance::User => {
                user_count += 1;
                user_bytes = user_bytes.saturating_add(record.size);
                let _ = write!(line, "[LEAK] {:#x}: {} bytes", address, record.size);
                line.flush_line();
                if stack_traces {
                    for &frame in record.frames().iter().take(REPORT_FRAMES) {
                        emit_frame(frame);
                    }
                }
                line.flush_line();
            }
        }
    }
    if user_count == 0 {
        line.flush_line();
    }

    let _ = line.write_str("Summary:");
    line.flush_line();
    let _ = write!(
        line,
        "  Real leaks: {} allocation(s), {} bytes",
        user_count, user_bytes
    );
    line.flush_line();
    if libc_count > 0 {
        let _ = write!(
            line,
            "  Libc infrastructure: {} allocation(s), {} bytes (ignored)",
            libc_count, libc_bytes
        );
        line.flush_line();
    }
    let _ = line.write_str("==================================");
    line.flush_line();
}

/// One stack frame in the shape `backtrace_symbols_fd` uses:
/// image, nearest symbol and offset when known, raw address always.
fn emit_frame(address: usize) {
    let mut line = LineBuf::new();
    format_frame(&mut line, address);
    line.flush_line();
}

fn format_frame(line: &mut LineBuf, address: usize) {
    let _ = line.write_str("  ");
    match classify::image_of(address) {
        Some(image) => {
            line.push_bytes(image.name.to_bytes());
            match image.symbol {
                Some((name, offset)) => {
                    let _ = line.write_str("(");
                    line.push_bytes(name.to_bytes());
                    let _ = write!(line, "+{:#x})", offset);
                }
                None => {
                    let _ = write!(line, "(+{:#x})", address - image.base);
                }
            }
            let _ = write!(line, " [{:#x}]", address);
        }
        None => {
            let _ = write!(line, "[{:#x}]", address);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::fmt::Write as _;

    use super::*;

    #[test]
    fn line_buf_truncates_instead_of_growing() {
        let mut line = LineBuf::new();
        let oversized = [b'a'; LINE_MAX + 100];
        line.push_bytes(&oversized);
        assert_eq!(line.as_bytes().len(), LINE_MAX);
        line.push_bytes(b"more");
        assert_eq!(line.as_bytes().len(), LINE_MAX);
        assert!(line.as_bytes().iter().all(|&b| b == b'a'));
    }

    #[test]
    fn line_buf_formats_addresses_as_hex() {
        let mut line = LineBuf::new();
        let _ = write!(line, "[LEAK] {:#x}: {} bytes", 0xdead_beefusize, 1024);
        assert_eq!(line.as_bytes(), b"[LEAK] 0xdeadbeef: 1024 bytes");
    }

    #[test]
    fn frame_line_resolves_libc_symbols() {
        let strlen = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"strlen".as_ptr()) };
        assert!(!strlen.is_null());
        let mut line = LineBuf::new();
        format_frame(&mut line, strlen as usize);
        let rendered = core::str::from_utf8(line.as_bytes()).unwrap();
        assert!(rendered.starts_with("  "), "indented: {rendered}");
        assert!(rendered.contains("libc"), "names the image: {rendered}");
        assert!(rendered.ends_with(']'), "carries the raw address: {rendered}");
    }

    #[test]
    fn frame_line_survives_unmapped_addresses() {
        let mut line = LineBuf::new();
        format_frame(&mut line, 0x10);
        let rendered = core::str::from_utf8(line.as_bytes()).unwrap();
        assert!(rendered.contains("0x10"), "{rendered}");
    }
}
