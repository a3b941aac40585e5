/// Calibration cache: remembers calibrated constants per (rate, variant,
/// upsampling) so a session only pays for calibration once.
///
/// The on-disk form is one line per entry, appended as calibrations finish:
///
///   SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=2.4765062331999998513 FETSVt=11490770993
///
/// Lookup takes the first matching line. Lines that do not parse are skipped.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::calibrate::Calibration;
use crate::config::Settings;
use crate::error::{NrError, NrResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub sample_rate: u32,
    pub variant: u8,
    /// Upsampling as configured; 0 means automatic.
    pub upsampling: u16,
}

impl CacheKey {
    pub fn for_settings(settings: &Settings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            variant: settings.variant.number(),
            upsampling: settings.upsampling_setting,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, filter variant {}, upsampling {}",
            self.sample_rate, self.variant, self.upsampling
        )
    }
}

/// Storage for calibration results.
///
/// Errors are reported but never fatal: the session treats a failed lookup
/// as a miss and a failed store as a no-op.
pub trait CalibrationCache {
    fn lookup(&self, key: &CacheKey) -> NrResult<Option<Calibration>>;
    fn store(&self, key: &CacheKey, calibration: &Calibration) -> NrResult<()>;
}

pub fn format_line(key: &CacheKey, calibration: &Calibration) -> String {
    format!(
        "SmpSec={} FltTyp={} UpSamp={} SidAmp={:.19} FETSVt={}\n",
        key.sample_rate, key.variant, key.upsampling, calibration.side_gain, calibration.source_volts
    )
}

/// Parse one cache line. Fields must appear in order; trailing text is ignored.
/// Constants outside the calibrated range are rejected like any other junk.
pub fn parse_line(line: &str) -> Option<(CacheKey, Calibration)> {
    let mut fields = line.split_whitespace();
    let mut field = |name: &str| fields.next()?.strip_prefix(name)?.strip_prefix('=');

    let sample_rate = field("SmpSec")?.parse().ok()?;
    let variant = field("FltTyp")?.parse().ok()?;
    let upsampling = field("UpSamp")?.parse().ok()?;
    let side_gain = field("SidAmp")?.parse().ok()?;
    let source_volts = field("FETSVt")?.parse().ok()?;
    let calibration = Calibration {
        side_gain,
        source_volts,
    };
    if !calibration.is_plausible() {
        return None;
    }
    Some((
        CacheKey {
            sample_rate,
            variant,
            upsampling,
        },
        calibration,
    ))
}

/// Append-only text file.
#[derive(Clone, Debug)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.libdolbyb` on Unix, `libdolbyb.cache` in the user cache directory
    /// elsewhere.
    pub fn user_default() -> Option<Self> {
        if cfg!(unix) {
            dirs_next::home_dir().map(|home| Self::new(home.join(".libdolbyb")))
        } else {
            dirs_next::cache_dir().map(|dir| Self::new(dir.join("libdolbyb.cache")))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationCache for FileCache {
    fn lookup(&self, key: &CacheKey) -> NrResult<Option<Calibration>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(NrError::Cache(format!("reading {}: {e}", self.path.display())));
            }
        };
        // A stray non-UTF-8 byte only spoils the line it sits on.
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(parse_line)
            .find(|(k, _)| k == key)
            .map(|(_, c)| c))
    }

    fn store(&self, key: &CacheKey, calibration: &Calibration) -> NrResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| NrError::Cache(format!("opening {}: {e}", self.path.display())))?;
        file.write_all(format_line(key, calibration).as_bytes())
            .map_err(|e| NrError::Cache(format!("writing {}: {e}", self.path.display())))
    }
}

/// In-process cache, mostly for tests and hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<Vec<(CacheKey, Calibration)>>,
}

impl MemoryCache {
    pub fn with_entries(entries: impl IntoIterator<Item = (CacheKey, Calibration)>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CalibrationCache for MemoryCache {
    fn lookup(&self, key: &CacheKey) -> NrResult<Option<Calibration>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| NrError::Cache("memory cache poisoned".into()))?;
        Ok(entries.iter().find(|(k, _)| k == key).map(|(_, c)| *c))
    }

    fn store(&self, key: &CacheKey, calibration: &Calibration) -> NrResult<()> {
        self.entries
            .lock()
            .map_err(|_| NrError::Cache("memory cache poisoned".into()))?
            .push((*key, *calibration));
        Ok(())
    }
}

/// Never hits, never stores.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl CalibrationCache for NoCache {
    fn lookup(&self, _key: &CacheKey) -> NrResult<Option<Calibration>> {
        Ok(None)
    }

    fn store(&self, _key: &CacheKey, _calibration: &Calibration) -> NrResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterVariant;

    fn key(rate: u32, variant: u8) -> CacheKey {
        CacheKey {
            sample_rate: rate,
            variant,
            upsampling: 0,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("opennr-cache-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_line_format() {
        let line = format_line(&key(44100, 4), &Calibration::nominal(FilterVariant::Type4));
        assert!(line.starts_with("SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=2.4765062331999998513 "));
        assert!(line.ends_with(" FETSVt=11490770993\n"));
        let decimals = line.split("SidAmp=").nth(1).unwrap().split(' ').next().unwrap();
        assert_eq!(decimals.split('.').nth(1).unwrap().len(), 19);
    }

    #[test]
    fn test_parse_preserves_values() {
        let cal = Calibration {
            side_gain: 3.123_456_789_012_345,
            source_volts: 11_400_000_123,
        };
        let (k, parsed) = parse_line(&format_line(&key(96000, 2), &cal)).unwrap();
        assert_eq!(k, key(96000, 2));
        assert_eq!(parsed, cal);
    }

    #[test]
    fn test_parse_skips_garbage() {
        for bad in [
            "",
            "hello",
            "SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=2.5",
            "SmpSec=x FltTyp=4 UpSamp=0 SidAmp=2.5 FETSVt=1",
            "FltTyp=4 SmpSec=44100 UpSamp=0 SidAmp=2.5 FETSVt=1",
            "SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=NaN FETSVt=1",
            "SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=1e300 FETSVt=11490770993",
            "SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=-2.5 FETSVt=11490770993",
            "SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=2.5 FETSVt=-9223372036854775800",
        ] {
            assert!(parse_line(bad).is_none(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_file_cache_round_trip() {
        let path = temp_path("round-trip");
        let _ = fs::remove_file(&path);
        let cache = FileCache::new(&path);

        assert_eq!(cache.lookup(&key(44100, 1)).unwrap(), None);

        let a = Calibration::nominal(FilterVariant::Type1);
        let b = Calibration::nominal(FilterVariant::Type3);
        cache.store(&key(44100, 1), &a).unwrap();
        cache.store(&key(48000, 3), &b).unwrap();
        // Later duplicates lose to the first entry.
        cache.store(&key(44100, 1), &b).unwrap();

        assert_eq!(cache.lookup(&key(44100, 1)).unwrap(), Some(a));
        assert_eq!(cache.lookup(&key(48000, 3)).unwrap(), Some(b));
        assert_eq!(cache.lookup(&key(48000, 4)).unwrap(), None);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_cache_tolerates_junk_lines() {
        let path = temp_path("junk");
        let good = format_line(&key(22050, 4), &Calibration::nominal(FilterVariant::Type4));
        fs::write(&path, format!("# notes\n\nnot a line\n{good}")).unwrap();
        let found = FileCache::new(&path).lookup(&key(22050, 4)).unwrap();
        assert_eq!(found, Some(Calibration::nominal(FilterVariant::Type4)));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_cache_skips_damaged_lines() {
        let path = temp_path("damaged");
        let good = format_line(&key(44100, 4), &Calibration::nominal(FilterVariant::Type4));
        let mut bytes = b"SmpSec=44100 FltTyp=4 UpSamp=0 SidAmp=1e300 FETSVt=11490770993\n".to_vec();
        bytes.extend_from_slice(b"SmpSec=44100 FltTyp=\xff\xfe4 UpSamp=0\n");
        bytes.extend_from_slice(good.as_bytes());
        fs::write(&path, bytes).unwrap();

        let found = FileCache::new(&path).lookup(&key(44100, 4)).unwrap();
        assert_eq!(found, Some(Calibration::nominal(FilterVariant::Type4)));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_unwritable_cache_reports_error() {
        let dir = temp_path("is-a-dir");
        fs::create_dir_all(&dir).unwrap();
        let cache = FileCache::new(&dir);
        let err = cache.store(&key(44100, 4), &Calibration::nominal(FilterVariant::Type4));
        assert!(matches!(err, Err(NrError::Cache(_))));
        assert!(matches!(cache.lookup(&key(44100, 4)), Err(NrError::Cache(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::default();
        assert!(cache.is_empty());
        let cal = Calibration::nominal(FilterVariant::Type2);
        cache.store(&key(32000, 2), &cal).unwrap();
        assert_eq!(cache.lookup(&key(32000, 2)).unwrap(), Some(cal));
        assert_eq!(NoCache.lookup(&key(32000, 2)).unwrap(), None);
    }
}
