//! `log` backend that never allocates, so it is safe to install while
//! [`crate::Allocator`] is the global allocator.
//!
//! Records are formatted into a fixed stack buffer (longer lines are cut) and
//! written to stderr with a single `write(2)`.

use core::fmt::{self, Write};

const LINE_MAX: usize = 256;

struct Logger;

struct Line {
  buf: [u8; LINE_MAX],
  len: usize,
}

impl Write for Line {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    // Keep room for the newline.
    let room = LINE_MAX - 1 - self.len;
    let n = s.len().min(room);
    self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
    self.len += n;
    Ok(())
  }
}

impl log::Log for Logger {
  fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
    metadata.level() <= log::max_level()
  }

  fn log(&self, record: &log::Record<'_>) {
    if !self.enabled(record.metadata()) {
      return;
    }

    let mod_path = record
      .module_path_static()
      .or_else(|| record.module_path())
      .unwrap_or("<n/a>");

    let mut line = Line {
      buf: [0; LINE_MAX],
      len: 0,
    };
    let _ = write!(line, "[ {:>5} ] [{}] {}", record.level(), mod_path, record.args());
    line.buf[line.len] = b'\n';
    line.len += 1;

    unsafe { libc::write(libc::STDERR_FILENO, line.buf.as_ptr().cast(), line.len) };
  }

  fn flush(&self) {}
}

/// Installs the stderr logger and sets the maximum level.
pub fn init(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
  log::set_logger(&Logger)?;
  log::set_max_level(level);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn long_lines_are_cut() {
    let mut line = Line {
      buf: [0; LINE_MAX],
      len: 0,
    };
    for _ in 0..100 {
      write!(line, "0123456789").unwrap();
    }
    assert_eq!(line.len, LINE_MAX - 1);
    assert!(line.buf[..line.len].iter().all(u8::is_ascii_digit));
  }
}
