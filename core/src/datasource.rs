//! Time-series and state-flag sources.
//!
//! The orchestrator talks to its collaborators only through the
//! [`DataSource`] and [`StateFlagSource`] traits.  Three implementations
//! are provided:
//!
//! - [`MemorySource`]: series and segments held in memory (embedding,
//!   tests).
//! - [`ChannelFileSource`]: binary channel files with a self-describing
//!   keyword header, indexed by an explicit [`ChannelCache`].
//! - [`SegmentFileSource`]: one plain-text segment list per flag.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::types::{Segment, TimeSeries};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by data and state-flag sources.
#[derive(Debug, thiserror::Error)]
pub enum DataSourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid channel file header in {}: {reason}", .path.display())]
    BadHeader { path: PathBuf, reason: String },

    #[error("unsupported sample width nbits={0}")]
    UnsupportedWidth(u32),

    #[error("unknown state flag '{0}'")]
    UnknownFlag(String),

    #[error("{}:{line}: invalid segment '{text}'", .path.display())]
    BadSegment { path: PathBuf, line: usize, text: String },
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Named series returned by a [`DataSource`].
#[derive(Clone, Debug, Default)]
pub struct SeriesBundle {
    series: HashMap<String, TimeSeries>,
}

impl SeriesBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, series: TimeSeries) {
        self.series.insert(series.name.clone(), series);
    }

    pub fn get(&self, name: &str) -> Option<&TimeSeries> {
        self.series.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Source of raw channel data.
pub trait DataSource {
    /// Fetch `[start, end)` for every name in `names`.  Names with no data
    /// in that window are omitted from the bundle rather than failing.
    fn get_samples(&self, names: &[String], start: f64, end: f64) -> Result<SeriesBundle, DataSourceError>;
}

/// Source of data-quality state flags.
pub trait StateFlagSource {
    /// Active segments of `flag` that intersect `[start, end)`, clipped to it.
    fn query_active_segments(&self, flag: &str, start: f64, end: f64) -> Result<Vec<Segment>, DataSourceError>;
}

fn clip_segments(segments: &[Segment], start: f64, end: f64) -> Vec<Segment> {
    let window = Segment::new(start, end);
    segments
        .iter()
        .filter(|s| s.intersects(&window))
        .map(|s| Segment::new(s.start.max(start), s.end.min(end)))
        .collect()
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// In-memory data and state-flag source.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    series: HashMap<String, TimeSeries>,
    flags: HashMap<String, Vec<Segment>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, series: TimeSeries) -> Self {
        self.series.insert(series.name.clone(), series);
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>, active: Vec<Segment>) -> Self {
        self.flags.insert(flag.into(), active);
        self
    }
}

impl DataSource for MemorySource {
    fn get_samples(&self, names: &[String], start: f64, end: f64) -> Result<SeriesBundle, DataSourceError> {
        let mut bundle = SeriesBundle::new();
        for name in names {
            if let Some(series) = self.series.get(name) {
                let cropped = series.crop(start, end);
                if !cropped.is_empty() {
                    bundle.insert(cropped);
                }
            }
        }
        Ok(bundle)
    }
}

impl StateFlagSource for MemorySource {
    fn query_active_segments(&self, flag: &str, start: f64, end: f64) -> Result<Vec<Segment>, DataSourceError> {
        self.flags
            .get(flag)
            .map(|segments| clip_segments(segments, start, end))
            .ok_or_else(|| DataSourceError::UnknownFlag(flag.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Channel files
// ---------------------------------------------------------------------------

/// Header of a channel file.
///
/// The file starts with the string `"HEADER_START"`, followed by
/// keyword-value pairs, and is terminated by `"HEADER_END"`.  Strings are
/// stored as a little-endian `u32` length followed by UTF-8 bytes.  The
/// remainder of the file is little-endian samples of `nbits` width.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelFileHeader {
    pub channel: String,
    pub sample_rate: f64,
    pub t0: f64,
    pub nbits: u32,
}

impl ChannelFileHeader {
    fn read_string<R: Read>(reader: &mut R, path: &Path) -> Result<String, DataSourceError> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > 1024 {
            return Err(DataSourceError::BadHeader {
                path: path.to_path_buf(),
                reason: format!("keyword length {} exceeds sanity limit", len),
            });
        }

        let mut str_buf = vec![0u8; len];
        reader.read_exact(&mut str_buf)?;
        Ok(String::from_utf8_lossy(&str_buf).to_string())
    }

    fn read_f64<R: Read>(reader: &mut R) -> Result<f64, DataSourceError> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    fn read_i32<R: Read>(reader: &mut R) -> Result<i32, DataSourceError> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn write_string<W: Write>(writer: &mut W, value: &str) -> std::io::Result<()> {
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(value.as_bytes())
    }

    /// Parse the header, leaving `reader` positioned at the first sample.
    pub fn read<R: Read>(reader: &mut R, path: &Path) -> Result<Self, DataSourceError> {
        let bad = |reason: &str| DataSourceError::BadHeader {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let magic = Self::read_string(reader, path)?;
        if magic != "HEADER_START" {
            return Err(bad("file does not start with HEADER_START"));
        }

        let mut channel = String::new();
        let mut sample_rate = 0.0;
        let mut t0 = 0.0;
        let mut nbits = 64;
        loop {
            let keyword = Self::read_string(reader, path)?;
            match keyword.as_str() {
                "HEADER_END" => break,
                "channel" => channel = Self::read_string(reader, path)?,
                "sample_rate" => sample_rate = Self::read_f64(reader)?,
                "t0" => t0 = Self::read_f64(reader)?,
                "nbits" => nbits = Self::read_i32(reader)? as u32,
                other => return Err(bad(&format!("unknown keyword '{}'", other))),
            }
        }

        if channel.is_empty() {
            return Err(bad("missing channel name"));
        }
        if !(sample_rate > 0.0) {
            return Err(bad("sample_rate must be positive"));
        }
        if nbits != 32 && nbits != 64 {
            return Err(DataSourceError::UnsupportedWidth(nbits));
        }
        Ok(Self {
            channel,
            sample_rate,
            t0,
            nbits,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        Self::write_string(writer, "HEADER_START")?;
        Self::write_string(writer, "channel")?;
        Self::write_string(writer, &self.channel)?;
        Self::write_string(writer, "sample_rate")?;
        writer.write_all(&self.sample_rate.to_le_bytes())?;
        Self::write_string(writer, "t0")?;
        writer.write_all(&self.t0.to_le_bytes())?;
        Self::write_string(writer, "nbits")?;
        writer.write_all(&(self.nbits as i32).to_le_bytes())?;
        Self::write_string(writer, "HEADER_END")
    }
}

/// Read a whole channel file.
pub fn read_channel_file(path: &Path) -> Result<TimeSeries, DataSourceError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = ChannelFileHeader::read(&mut reader, path)?;

    let mut raw_bytes = Vec::new();
    reader.read_to_end(&mut raw_bytes)?;
    let data: Vec<f64> = match header.nbits {
        32 => raw_bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        64 => raw_bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        other => return Err(DataSourceError::UnsupportedWidth(other)),
    };

    Ok(TimeSeries::new(header.channel, header.t0, header.sample_rate, data))
}

/// Write `series` as a channel file with `nbits`-wide samples (32 or 64).
pub fn write_channel_file(path: &Path, series: &TimeSeries, nbits: u32) -> Result<(), DataSourceError> {
    if nbits != 32 && nbits != 64 {
        return Err(DataSourceError::UnsupportedWidth(nbits));
    }
    let mut writer = BufWriter::new(File::create(path)?);
    ChannelFileHeader {
        channel: series.name.clone(),
        sample_rate: series.sample_rate,
        t0: series.t0,
        nbits,
    }
    .write(&mut writer)?;
    for &v in &series.data {
        if nbits == 32 {
            writer.write_all(&(v as f32).to_le_bytes())?;
        } else {
            writer.write_all(&v.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Index of channel files: which file holds which channel, over what span.
///
/// Owned by one [`ChannelFileSource`] for the lifetime of a run.
#[derive(Clone, Debug, Default)]
pub struct ChannelCache {
    entries: HashMap<String, Vec<(PathBuf, Segment)>>,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a single file by reading its header.
    pub fn add_file(&mut self, path: &Path) -> Result<(), DataSourceError> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = ChannelFileHeader::read(&mut reader, path)?;
        let bytes = fs::metadata(path)?.len();
        let nsamples = bytes.saturating_sub(header_len(&header)) / (header.nbits as u64 / 8).max(1);
        let span = Segment::new(header.t0, header.t0 + nsamples as f64 / header.sample_rate);
        debug!("Indexed {} [{}, {}) from {}", header.channel, span.start, span.end, path.display());
        self.entries
            .entry(header.channel)
            .or_default()
            .push((path.to_path_buf(), span));
        Ok(())
    }

    /// Index every readable channel file in `dir`; other files are skipped.
    pub fn scan_dir(dir: &Path) -> Result<Self, DataSourceError> {
        let mut cache = Self::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            if let Err(e) = cache.add_file(&path) {
                debug!("Skipping {}: {}", path.display(), e);
            }
        }
        Ok(cache)
    }

    /// Index the files listed, one path per line, in a cache file.
    /// Relative paths are resolved against the cache file's directory.
    pub fn from_list(list: &Path) -> Result<Self, DataSourceError> {
        let base = list.parent().unwrap_or_else(|| Path::new("."));
        let mut cache = Self::new();
        for line in BufReader::new(File::open(list)?).lines() {
            let line = line?;
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            cache.add_file(&base.join(entry))?;
        }
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A file holding `channel` over the whole of `window`.
    pub fn locate(&self, channel: &str, window: &Segment) -> Option<&Path> {
        self.entries
            .get(channel)?
            .iter()
            .find(|(_, span)| span.covers(window))
            .map(|(path, _)| path.as_path())
    }
}

fn header_len(header: &ChannelFileHeader) -> u64 {
    let string = |s: &str| 4 + s.len() as u64;
    string("HEADER_START")
        + string("channel")
        + string(&header.channel)
        + string("sample_rate")
        + 8
        + string("t0")
        + 8
        + string("nbits")
        + 4
        + string("HEADER_END")
}

/// [`DataSource`] over channel files.
#[derive(Clone, Debug)]
pub struct ChannelFileSource {
    cache: ChannelCache,
}

impl ChannelFileSource {
    pub fn new(cache: ChannelCache) -> Self {
        Self { cache }
    }

    pub fn from_dir(dir: &Path) -> Result<Self, DataSourceError> {
        Ok(Self::new(ChannelCache::scan_dir(dir)?))
    }

    /// Open `location`: a directory of channel files, or a cache file
    /// listing them.
    pub fn open(location: &Path) -> Result<Self, DataSourceError> {
        if location.is_dir() {
            Self::from_dir(location)
        } else {
            Ok(Self::new(ChannelCache::from_list(location)?))
        }
    }

    pub fn cache(&self) -> &ChannelCache {
        &self.cache
    }
}

impl DataSource for ChannelFileSource {
    fn get_samples(&self, names: &[String], start: f64, end: f64) -> Result<SeriesBundle, DataSourceError> {
        let window = Segment::new(start, end);
        let mut bundle = SeriesBundle::new();
        for name in names {
            let Some(path) = self.cache.locate(name, &window) else {
                warn!("No data for {} covering [{}, {})", name, start, end);
                continue;
            };
            match read_channel_file(path) {
                Ok(series) => bundle.insert(series.crop(start, end)),
                Err(e) => warn!("Cannot read {} from {}: {}", name, path.display(), e),
            }
        }
        Ok(bundle)
    }
}

// ---------------------------------------------------------------------------
// Segment files
// ---------------------------------------------------------------------------

/// [`StateFlagSource`] reading `<dir>/<flag>.txt`, where `:` in the flag
/// name is replaced by `_`.  Each non-comment line holds `start end`.
#[derive(Clone, Debug)]
pub struct SegmentFileSource {
    dir: PathBuf,
}

impl SegmentFileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn flag_path(&self, flag: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", flag.replace(':', "_")))
    }
}

impl StateFlagSource for SegmentFileSource {
    fn query_active_segments(&self, flag: &str, start: f64, end: f64) -> Result<Vec<Segment>, DataSourceError> {
        let path = self.flag_path(flag);
        if !path.exists() {
            return Err(DataSourceError::UnknownFlag(flag.to_string()));
        }
        let mut segments = Vec::new();
        for (i, line) in BufReader::new(File::open(&path)?).lines().enumerate() {
            let line = line?;
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let bad = || DataSourceError::BadSegment {
                path: path.clone(),
                line: i + 1,
                text: text.to_string(),
            };
            let fields: Vec<f64> = text
                .split_whitespace()
                .map(|f| f.parse::<f64>().map_err(|_| bad()))
                .collect::<Result<_, _>>()?;
            match fields.as_slice() {
                [s, e] if s <= e => segments.push(Segment::new(*s, *e)),
                _ => return Err(bad()),
            }
        }
        Ok(clip_segments(&segments, start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(name: &str, t0: f64, fs: f64, n: usize) -> TimeSeries {
        TimeSeries::new(name, t0, fs, (0..n).map(|i| i as f64 * 0.5).collect())
    }

    #[test]
    fn test_memory_source_omits_unknown_names() {
        let source = MemorySource::new().with_series(ramp("X1:A", 0.0, 16.0, 160));
        let names = vec!["X1:A".to_string(), "X1:MISSING".to_string()];
        let bundle = source.get_samples(&names, 2.0, 4.0).unwrap();
        assert_eq!(bundle.len(), 1);
        let a = bundle.get("X1:A").unwrap();
        assert_eq!(a.t0, 2.0);
        assert_eq!(a.len(), 32);
        assert!(!bundle.contains("X1:MISSING"));
    }

    #[test]
    fn test_memory_flags_are_clipped() {
        let source = MemorySource::new().with_flag(
            "X1:READY:1",
            vec![Segment::new(0.0, 10.0), Segment::new(20.0, 30.0), Segment::new(50.0, 60.0)],
        );
        let active = source.query_active_segments("X1:READY:1", 5.0, 25.0).unwrap();
        assert_eq!(active, vec![Segment::new(5.0, 10.0), Segment::new(20.0, 25.0)]);
        assert!(source.query_active_segments("X1:OTHER:1", 0.0, 1.0).is_err());
    }

    #[test]
    fn test_channel_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.chan");
        let series = ramp("X1:A", 100.0, 64.0, 640);
        write_channel_file(&path, &series, 64).unwrap();
        assert_eq!(read_channel_file(&path).unwrap(), series);

        let path32 = dir.path().join("b.chan");
        write_channel_file(&path32, &ramp("X1:B", 100.0, 64.0, 640), 32).unwrap();
        let b = read_channel_file(&path32).unwrap();
        assert_eq!(b.len(), 640);
        assert_eq!(b.data[3], 1.5);

        assert!(matches!(
            write_channel_file(&path, &series, 16),
            Err(DataSourceError::UnsupportedWidth(16))
        ));
    }

    #[test]
    fn test_file_source_locates_and_crops() {
        let dir = tempfile::tempdir().unwrap();
        write_channel_file(&dir.path().join("a.chan"), &ramp("X1:A", 100.0, 64.0, 640), 64).unwrap();
        write_channel_file(&dir.path().join("b.chan"), &ramp("X1:B", 100.0, 32.0, 320), 32).unwrap();
        std::fs::write(dir.path().join("README"), b"not a channel file").unwrap();

        let source = ChannelFileSource::from_dir(dir.path()).unwrap();
        assert_eq!(source.cache().len(), 2);

        let names = vec!["X1:A".to_string(), "X1:B".to_string(), "X1:C".to_string()];
        let bundle = source.get_samples(&names, 102.0, 104.0).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get("X1:A").unwrap().len(), 128);
        assert_eq!(bundle.get("X1:B").unwrap().len(), 64);

        // Outside the recorded span.
        let bundle = source.get_samples(&names, 105.0, 120.0).unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_unreadable_file_only_drops_its_channel() {
        let dir = tempfile::tempdir().unwrap();
        write_channel_file(&dir.path().join("good.chan"), &ramp("X1:GOOD", 0.0, 64.0, 640), 64).unwrap();
        write_channel_file(&dir.path().join("gone.chan"), &ramp("X1:GONE", 0.0, 64.0, 640), 64).unwrap();

        // A 16-bit file has a well-formed header but is never indexed.
        let mut wide = BufWriter::new(File::create(dir.path().join("wide.chan")).unwrap());
        ChannelFileHeader {
            channel: "X1:WIDE".into(),
            sample_rate: 64.0,
            t0: 0.0,
            nbits: 16,
        }
        .write(&mut wide)
        .unwrap();
        wide.write_all(&[0u8; 1280]).unwrap();
        drop(wide);

        let source = ChannelFileSource::from_dir(dir.path()).unwrap();
        assert_eq!(source.cache().len(), 2);
        assert!(source.cache().locate("X1:WIDE", &Segment::new(1.0, 2.0)).is_none());

        // Indexed, then removed before the read.
        std::fs::remove_file(dir.path().join("gone.chan")).unwrap();

        let names = vec!["X1:GOOD".to_string(), "X1:GONE".to_string(), "X1:WIDE".to_string()];
        let bundle = source.get_samples(&names, 1.0, 2.0).unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.get("X1:GOOD").unwrap().len(), 64);
    }

    #[test]
    fn test_cache_list_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_channel_file(&dir.path().join("a.chan"), &ramp("X1:A", 0.0, 16.0, 64), 64).unwrap();
        std::fs::write(dir.path().join("data.cache"), "# channel files\na.chan\n").unwrap();
        let source = ChannelFileSource::open(&dir.path().join("data.cache")).unwrap();
        assert!(source.cache().locate("X1:A", &Segment::new(1.0, 2.0)).is_some());
        assert!(source.cache().locate("X1:A", &Segment::new(1.0, 5.0)).is_none());
    }

    #[test]
    fn test_segment_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = SegmentFileSource::new(dir.path());
        std::fs::write(
            source.flag_path("X1:DMT-READY:1"),
            "# start end\n0 100\n150 300\n",
        )
        .unwrap();

        let active = source.query_active_segments("X1:DMT-READY:1", 50.0, 200.0).unwrap();
        assert_eq!(active, vec![Segment::new(50.0, 100.0), Segment::new(150.0, 200.0)]);
        assert!(matches!(
            source.query_active_segments("X1:NOPE:1", 0.0, 1.0),
            Err(DataSourceError::UnknownFlag(_))
        ));

        std::fs::write(source.flag_path("X1:BROKEN:1"), "10 five\n").unwrap();
        assert!(matches!(
            source.query_active_segments("X1:BROKEN:1", 0.0, 100.0),
            Err(DataSourceError::BadSegment { line: 1, .. })
        ));
    }
}
