//! Log files partitioned by calendar day.
//!
//! A [`DailyFileWriter`] owns at most one open file, named
//! `{dir}/{prefix}-{YYYY-MM-DD}.log`. Every write checks the current date
//! under the writer's lock and switches files when the day has changed, so
//! concurrent writers can never race a rotation. When the directory or file
//! cannot be opened the bytes go to the writer's fallback sink instead.

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Source of "today" for rotation decisions
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

const DATE_FORMAT: &str = "%Y-%m-%d";

struct SinkState {
    current_date: Option<String>,
    file: Option<File>,
    fallback: Box<dyn Write + Send>,
    in_fallback: bool,
}

/// Append-only writer that starts a new file each day
pub struct DailyFileWriter {
    dir: PathBuf,
    prefix: String,
    clock: Clock,
    state: Mutex<SinkState>,
}

impl DailyFileWriter {
    /// Writer using local time and stdout as fallback
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            clock: Arc::new(|| Local::now().date_naive()),
            state: Mutex::new(SinkState {
                current_date: None,
                file: None,
                fallback: Box::new(io::stdout()),
                in_fallback: false,
            }),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the sink that receives writes while the day file is unavailable
    #[cfg(test)]
    pub fn with_fallback(mut self, fallback: Box<dyn Write + Send>) -> Self {
        self.state.get_mut().fallback = fallback;
        self
    }

    /// Path of the file for `date` (formatted `YYYY-MM-DD`)
    pub fn path_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.log", self.prefix, date))
    }

    /// Path of the currently open file, if any
    #[cfg(test)]
    pub fn current_path(&self) -> Option<PathBuf> {
        let state = self.state.lock();
        match (&state.file, &state.current_date) {
            (Some(_), Some(date)) => Some(self.path_for(date)),
            _ => None,
        }
    }

    /// Write `buf` in full to today's file, rotating first if needed
    fn write_entry(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        // Dated under the lock so concurrent writers agree on the day
        let today = (self.clock)().format(DATE_FORMAT).to_string();
        let stale = state.file.is_none() || state.current_date.as_deref() != Some(today.as_str());
        if stale {
            if let Err(err) = self.rotate(&mut state, &today) {
                if !state.in_fallback {
                    state.in_fallback = true;
                    let notice = format!(
                        "log sink {}: cannot open {}: {}; writing to fallback\n",
                        self.prefix,
                        self.path_for(&today).display(),
                        err
                    );
                    let _ = state.fallback.write_all(notice.as_bytes());
                }
                state.fallback.write_all(buf)?;
                return Ok(buf.len());
            }
            state.in_fallback = false;
        }

        match state.file.as_mut() {
            Some(file) => file.write_all(buf)?,
            None => state.fallback.write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn rotate(&self, state: &mut SinkState, date: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(date))?;

        // The previous day's handle is closed only once the new one is open
        if let Some(previous) = state.file.replace(file) {
            drop(previous);
        }
        state.current_date = Some(date.to_string());
        Ok(())
    }
}

impl Write for &DailyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_entry(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.file.as_mut() {
            Some(file) => file.flush(),
            None => state.fallback.flush(),
        }
    }
}

impl fmt::Debug for DailyFileWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DailyFileWriter")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Directory part of a log path, for startup messages
pub fn display_dir(dir: &Path) -> String {
    match dir.canonicalize() {
        Ok(abs) => abs.display().to_string(),
        Err(_) => dir.display().to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Barrier;
    use std::thread;

    /// Clock that starts at `start` and advances when told to
    pub(crate) fn manual_clock(start: NaiveDate) -> (Clock, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let days = Arc::clone(&offset);
        let clock: Clock = Arc::new(move || {
            start + chrono::Duration::days(days.load(Ordering::SeqCst))
        });
        (clock, offset)
    }

    /// In-memory fallback sink that can be inspected after use
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn creates_directory_and_dated_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        let (clock, _) = manual_clock(date(2024, 3, 1));
        let writer = DailyFileWriter::new(&dir, "access").with_clock(clock);

        (&writer).write_all(b"hello\n").unwrap();

        let path = dir.join("access-2024-03-01.log");
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
        assert_eq!(writer.current_path(), Some(path));
    }

    #[test]
    fn day_change_rotates_into_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (clock, days) = manual_clock(date(2024, 12, 31));
        let writer = DailyFileWriter::new(tmp.path(), "error").with_clock(clock);

        (&writer).write_all(b"day one a\n").unwrap();
        (&writer).write_all(b"day one b\n").unwrap();
        days.store(1, Ordering::SeqCst);
        (&writer).write_all(b"day two\n").unwrap();

        let first = fs::read_to_string(tmp.path().join("error-2024-12-31.log")).unwrap();
        let second = fs::read_to_string(tmp.path().join("error-2025-01-01.log")).unwrap();
        assert_eq!(first, "day one a\nday one b\n");
        assert_eq!(second, "day two\n");
        assert_eq!(
            writer.current_path(),
            Some(tmp.path().join("error-2025-01-01.log"))
        );
    }

    #[test]
    fn appends_to_existing_file_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let (clock, _) = manual_clock(date(2024, 5, 5));

        {
            let writer = DailyFileWriter::new(tmp.path(), "access").with_clock(clock.clone());
            (&writer).write_all(b"before\n").unwrap();
        }
        let writer = DailyFileWriter::new(tmp.path(), "access").with_clock(clock);
        (&writer).write_all(b"after\n").unwrap();

        let content = fs::read_to_string(tmp.path().join("access-2024-05-05.log")).unwrap();
        assert_eq!(content, "before\nafter\n");
    }

    #[test]
    fn open_failure_goes_to_fallback_with_single_notice() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the directory should be makes create_dir_all fail
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let fallback = SharedBuf::default();
        let (clock, _) = manual_clock(date(2024, 1, 1));
        let writer = DailyFileWriter::new(&blocker, "error")
            .with_clock(clock)
            .with_fallback(Box::new(fallback.clone()));

        assert_eq!((&writer).write(b"first\n").unwrap(), 6);
        assert_eq!((&writer).write(b"second\n").unwrap(), 7);

        let out = fallback.contents();
        assert_eq!(out.matches("cannot open").count(), 1);
        assert!(out.contains("error-2024-01-01.log"));
        assert!(out.ends_with("first\nsecond\n"));
        assert_eq!(writer.current_path(), None);
    }

    #[test]
    fn recovers_from_fallback_once_directory_is_usable() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        fs::write(&dir, b"x").unwrap();

        let fallback = SharedBuf::default();
        let (clock, _) = manual_clock(date(2024, 1, 1));
        let writer = DailyFileWriter::new(&dir, "access")
            .with_clock(clock)
            .with_fallback(Box::new(fallback.clone()));

        (&writer).write_all(b"lost to fallback\n").unwrap();
        fs::remove_file(&dir).unwrap();
        (&writer).write_all(b"on disk\n").unwrap();

        let content = fs::read_to_string(dir.join("access-2024-01-01.log")).unwrap();
        assert_eq!(content, "on disk\n");
        assert!(fallback.contents().contains("lost to fallback"));
    }

    #[test]
    fn stalled_writer_never_reopens_the_previous_day() {
        let tmp = tempfile::tempdir().unwrap();
        let days = Arc::new(AtomicI64::new(0));
        let read = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));

        // The writer on the "stalled" thread pauses right after reading the date
        let clock: Clock = {
            let days = Arc::clone(&days);
            let read = Arc::clone(&read);
            let resume = Arc::clone(&resume);
            Arc::new(move || {
                let today = date(2024, 12, 31) + chrono::Duration::days(days.load(Ordering::SeqCst));
                if thread::current().name() == Some("stalled") {
                    read.wait();
                    resume.wait();
                }
                today
            })
        };
        let writer = Arc::new(DailyFileWriter::new(tmp.path(), "access").with_clock(clock));

        let stalled = {
            let writer = Arc::clone(&writer);
            thread::Builder::new()
                .name("stalled".to_string())
                .spawn(move || (&*writer).write_all(b"late\n").unwrap())
                .unwrap()
        };
        read.wait();
        days.store(1, Ordering::SeqCst);
        let next_day = {
            let writer = Arc::clone(&writer);
            thread::spawn(move || (&*writer).write_all(b"next day\n").unwrap())
        };
        thread::sleep(std::time::Duration::from_millis(100));
        resume.wait();
        stalled.join().unwrap();
        next_day.join().unwrap();

        let today = tmp.path().join("access-2025-01-01.log");
        assert_eq!(writer.current_path(), Some(today.clone()));
        assert_eq!(fs::read_to_string(today).unwrap(), "next day\n");
        let yesterday = fs::read_to_string(tmp.path().join("access-2024-12-31.log")).unwrap();
        assert_eq!(yesterday, "late\n");
    }

    #[test]
    fn concurrent_writers_never_interleave_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let (clock, _) = manual_clock(date(2024, 2, 2));
        let writer = Arc::new(DailyFileWriter::new(tmp.path(), "access").with_clock(clock));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for i in 0..200 {
                        let line = format!("thread={} line={}\n", t, i);
                        (&*writer).write_all(line.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = fs::read_to_string(tmp.path().join("access-2024-02-02.log")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 8 * 200);
        assert!(lines
            .iter()
            .all(|l| l.starts_with("thread=") && l.contains(" line=")));
    }
}
