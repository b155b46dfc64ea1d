//! Append-only baled XML audit log.
//!
//! On-disk format is a well-formed XML document rooted at `<alarm-log>`.
//! Invariant: after every successful write the file ends with
//! `</alarm-log>\r\n`, so an abrupt termination at any point leaves a
//! parseable document. The closing tag is rewritten after each event and the
//! write pointer reseeks to just before it.
//!
//! IO failures disable the logger rather than crash the engine; the failure
//! is reported through tracing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::xml::Element;

const OPEN_TAG: &str = "<alarm-log>\r\n";
const CLOSE_TAG: &str = "</alarm-log>\r\n";
const CLOSE_TOKEN: &[u8] = b"</alarm-log>";

#[derive(Debug)]
pub struct AlarmLogger {
    dir: PathBuf,
    base_name: String,
    bale_size: u64,
    bale_count: u32,
    /// Interval for time-based baling; the manager owns the timer.
    time_interval_ms: Option<i64>,
    enabled: bool,
    file: Option<File>,
    /// Offset of the closing tag; events are written from here.
    write_pos: u64,
    failed: bool,
}

impl AlarmLogger {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
            bale_size: 1_048_576,
            bale_count: 4,
            time_interval_ms: None,
            enabled: false,
            file: None,
            write_pos: 0,
            failed: false,
        }
    }

    pub fn set_bale_params(&mut self, size: u64, count: u32) {
        self.bale_size = size.max(1024);
        self.bale_count = count.max(1);
    }

    pub fn set_time_based(&mut self, interval_ms: i64) {
        self.time_interval_ms = Some(interval_ms);
    }

    pub fn time_interval_ms(&self) -> Option<i64> {
        self.time_interval_ms
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.file = None;
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn bale_size(&self) -> u64 {
        self.bale_size
    }

    pub fn bale_count(&self) -> u32 {
        self.bale_count
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.base_name)
    }

    /// Append one event fragment, maintaining the envelope invariant.
    pub fn write_event(&mut self, event: &Element) {
        if !self.enabled || self.failed {
            return;
        }
        if let Err(e) = self.try_write(event) {
            error!("[AlarmLogger] write failed, disabling log: {e}");
            self.failed = true;
            self.file = None;
        }
    }

    fn try_write(&mut self, event: &Element) -> std::io::Result<()> {
        self.ensure_open()?;
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut fragment = event.to_xml();
        fragment.push_str("\r\n");
        file.seek(SeekFrom::Start(self.write_pos))?;
        file.write_all(fragment.as_bytes())?;
        self.write_pos += fragment.len() as u64;
        file.write_all(CLOSE_TAG.as_bytes())?;
        let end = self.write_pos + CLOSE_TAG.len() as u64;
        file.set_len(end)?;
        file.flush()?;
        if self.write_pos >= self.bale_size {
            self.bale_now()?;
        }
        Ok(())
    }

    /// Open (or reopen) the work file and establish the envelope.
    ///
    /// An empty file gets a fresh envelope. A non-empty file is scanned
    /// backward for the closing token; the write pointer lands on it so the
    /// next event overwrites from there. A file with no closing token is
    /// treated as empty.
    fn ensure_open(&mut self) -> std::io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path())?;
        let len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            file.write_all(OPEN_TAG.as_bytes())?;
            self.write_pos = OPEN_TAG.len() as u64;
            file.write_all(CLOSE_TAG.as_bytes())?;
            file.flush()?;
        } else {
            match find_close_tag(&mut file, len)? {
                Some(offset) => {
                    self.write_pos = offset;
                }
                None => {
                    info!(
                        "[AlarmLogger] no closing tag in {}; re-initializing envelope",
                        self.path().display()
                    );
                    file.set_len(0)?;
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(OPEN_TAG.as_bytes())?;
                    self.write_pos = OPEN_TAG.len() as u64;
                    file.write_all(CLOSE_TAG.as_bytes())?;
                    file.flush()?;
                }
            }
        }
        self.file = Some(file);
        Ok(())
    }

    /// Rotate the work file into the bale series `name.$N.ext`, `$1` being
    /// the newest bale; bales past the configured count are dropped.
    pub fn bale_now(&mut self) -> std::io::Result<()> {
        if self.failed {
            return Ok(());
        }
        let work = self.path();
        if self.file.is_none() && !work.exists() {
            return Ok(());
        }
        self.file = None;
        self.write_pos = 0;
        // shift older bales up, dropping any past the cap
        for n in (1..=self.bale_count).rev() {
            let from = self.bale_path(n);
            if !from.exists() {
                continue;
            }
            if n >= self.bale_count {
                std::fs::remove_file(&from)?;
            } else {
                std::fs::rename(&from, self.bale_path(n + 1))?;
            }
        }
        std::fs::rename(&work, self.bale_path(1))?;
        Ok(())
    }

    fn bale_path(&self, n: u32) -> PathBuf {
        let (stem, ext) = match self.base_name.rsplit_once('.') {
            Some((stem, ext)) => (stem.to_string(), ext.to_string()),
            None => (self.base_name.clone(), "log".to_string()),
        };
        self.dir.join(format!("{stem}.${n}.{ext}"))
    }
}

/// Scan backward from the end of the file for the last `</alarm-log>`.
fn find_close_tag(file: &mut File, len: u64) -> std::io::Result<Option<u64>> {
    const CHUNK: u64 = 64 * 1024;
    let overlap = CLOSE_TOKEN.len() as u64;
    let mut window_end = len;
    while window_end > 0 {
        let window_start = window_end.saturating_sub(CHUNK);
        let mut buf = vec![0u8; (window_end - window_start) as usize];
        file.seek(SeekFrom::Start(window_start))?;
        file.read_exact(&mut buf)?;
        if let Some(pos) = rfind(&buf, CLOSE_TOKEN) {
            return Ok(Some(window_start + pos as u64));
        }
        if window_start == 0 {
            break;
        }
        // keep an overlap so a token spanning chunks is still found
        window_end = window_start + overlap;
    }
    Ok(None)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: &str, alarm: &str) -> Element {
        let mut elem = Element::new(kind);
        elem.set_attr("name", alarm);
        elem.set_attr("date", "2024-06-01T00:00:00.000Z");
        elem
    }

    fn read_log(logger: &AlarmLogger) -> String {
        std::fs::read_to_string(logger.path()).unwrap()
    }

    #[test]
    fn file_always_ends_with_closing_tag() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
        logger.set_enabled(true);
        logger.write_event(&event("alarm-triggered", "a"));
        logger.write_event(&event("alarm-off", "a"));
        let content = read_log(&logger);
        assert!(content.starts_with("<alarm-log>\r\n"));
        assert!(content.ends_with("</alarm-log>\r\n"));
        let parsed = Element::parse(&content).unwrap();
        assert_eq!(parsed.children().count(), 2);
    }

    #[test]
    fn reopen_appends_after_existing_events() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
            logger.set_enabled(true);
            logger.write_event(&event("alarm-triggered", "a"));
        }
        let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
        logger.set_enabled(true);
        logger.write_event(&event("alarm-off", "a"));
        let parsed = Element::parse(&read_log(&logger)).unwrap();
        let kinds: Vec<&str> = parsed.children().map(|c| c.name.as_str()).collect();
        assert_eq!(kinds, vec!["alarm-triggered", "alarm-off"]);
    }

    #[test]
    fn truncated_file_recovers_to_valid_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
            logger.set_enabled(true);
            for i in 0..10 {
                logger.write_event(&event("alarm-triggered", &format!("a{i}")));
            }
            path = logger.path();
        }
        // chop the file mid-event, after the fourth event's close tag region
        let content = std::fs::read(&path).unwrap();
        let cut = content.len() * 2 / 5;
        std::fs::write(&path, &content[..cut]).unwrap();

        let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
        logger.set_enabled(true);
        logger.write_event(&event("alarm-off", "post-truncate"));
        let parsed = Element::parse(&read_log(&logger)).unwrap();
        // parses cleanly, with at most the pre-truncation events preserved
        assert!(parsed.children().count() <= 11);
        assert!(parsed
            .children()
            .any(|c| c.attr("name") == Some("post-truncate")));
    }

    #[test]
    fn truncated_file_without_close_tag_is_reinitialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.xml");
        std::fs::write(&path, "<alarm-log>\r\n<alarm-trig").unwrap();
        let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
        logger.set_enabled(true);
        logger.write_event(&event("alarm-triggered", "fresh"));
        let parsed = Element::parse(&read_log(&logger)).unwrap();
        assert_eq!(parsed.children().count(), 1);
    }

    #[test]
    fn size_baling_rotates_and_caps_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
        logger.set_enabled(true);
        logger.set_bale_params(1024, 2);
        // each event is ~70 bytes; enough to roll several bales
        for i in 0..100 {
            logger.write_event(&event("alarm-triggered", &format!("alarm-{i}")));
        }
        assert!(dir.path().join("alarms.$1.xml").exists());
        assert!(dir.path().join("alarms.$2.xml").exists());
        assert!(!dir.path().join("alarms.$3.xml").exists());
        // every bale is itself valid XML
        let bale = std::fs::read_to_string(dir.path().join("alarms.$1.xml")).unwrap();
        Element::parse(&bale).unwrap();
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = AlarmLogger::new(dir.path(), "alarms.xml");
        logger.write_event(&event("alarm-triggered", "a"));
        assert!(!logger.path().exists());
    }
}
