//! Binary settings codec for per-project plugin state
//!
//! A settings file is a fixed-order sequence of little-endian primitives:
//!
//! ```text
//! "TBPS" | u32 schema version | field | field | ...
//! ```
//!
//! Strings are UTF-8 prefixed with their byte length as a 7-bit varint.
//! The field order after the header is owned by each plugin; the header lets
//! a reader notice a schema it does not understand instead of misreading it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use tb_core::ImageMapInformation;

/// Leading bytes of every settings file
pub const SETTINGS_MAGIC: [u8; 4] = *b"TBPS";

/// Longest string a reader accepts
pub const MAX_STRING_LEN: usize = 16 * 1024 * 1024;

/// Errors reading or writing a settings file
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Settings file is truncated")]
    Truncated,

    #[error("Not a settings file (bad magic)")]
    BadMagic,

    #[error("Settings schema version {found} does not match expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid string in settings file: {0}")]
    InvalidString(String),

    #[error("Invalid value in settings file: {0}")]
    InvalidValue(String),
}

pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

fn map_read_err(err: io::Error) -> PersistenceError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        PersistenceError::Truncated
    } else {
        PersistenceError::Io(err)
    }
}

/// Write `value` as a 7-bit varint, low groups first.
pub fn write_7bit_len<W: Write>(w: &mut W, value: usize) -> io::Result<()> {
    let mut v = value as u64;
    while v >= 0x80 {
        w.write_u8((v as u8) | 0x80)?;
        v >>= 7;
    }
    w.write_u8(v as u8)
}

pub fn read_7bit_len<R: Read>(r: &mut R) -> PersistenceResult<usize> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = r.read_u8().map_err(map_read_err)?;
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 35 {
            return Err(PersistenceError::InvalidString(
                "length prefix is too long".to_string(),
            ));
        }
    }
    Ok(result as usize)
}

pub fn write_string<W: Write>(w: &mut W, value: &str) -> io::Result<()> {
    write_7bit_len(w, value.len())?;
    w.write_all(value.as_bytes())
}

pub fn read_string<R: Read>(r: &mut R) -> PersistenceResult<String> {
    let len = read_7bit_len(r)?;
    if len > MAX_STRING_LEN {
        return Err(PersistenceError::InvalidString(format!(
            "length {} exceeds {}",
            len, MAX_STRING_LEN
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(map_read_err)?;
    String::from_utf8(buf).map_err(|e| PersistenceError::InvalidString(e.to_string()))
}

/// Write an [`ImageMapInformation`] in its persisted field order.
pub fn write_map<W: Write>(w: &mut W, map: &ImageMapInformation) -> io::Result<()> {
    write_string(w, &map.filename)?;
    write_string(w, &map.filename_intermediate)?;
    write_string(w, &map.filename_mask)?;
    write_string(w, &map.filename_intermediate_mask)?;
    w.write_f64::<LittleEndian>(map.latitude)?;
    w.write_f64::<LittleEndian>(map.longitude)?;
    w.write_f64::<LittleEndian>(map.coverage_x)?;
    w.write_f64::<LittleEndian>(map.coverage_z)?;
    w.write_i32::<LittleEndian>(map.width)?;
    w.write_i32::<LittleEndian>(map.height)?;
    w.write_i32::<LittleEndian>(map.width_mask)?;
    w.write_i32::<LittleEndian>(map.height_mask)
}

pub fn read_map<R: Read>(r: &mut R) -> PersistenceResult<ImageMapInformation> {
    Ok(ImageMapInformation {
        filename: read_string(r)?,
        filename_intermediate: read_string(r)?,
        filename_mask: read_string(r)?,
        filename_intermediate_mask: read_string(r)?,
        latitude: r.read_f64::<LittleEndian>().map_err(map_read_err)?,
        longitude: r.read_f64::<LittleEndian>().map_err(map_read_err)?,
        coverage_x: r.read_f64::<LittleEndian>().map_err(map_read_err)?,
        coverage_z: r.read_f64::<LittleEndian>().map_err(map_read_err)?,
        width: r.read_i32::<LittleEndian>().map_err(map_read_err)?,
        height: r.read_i32::<LittleEndian>().map_err(map_read_err)?,
        width_mask: r.read_i32::<LittleEndian>().map_err(map_read_err)?,
        height_mask: r.read_i32::<LittleEndian>().map_err(map_read_err)?,
    })
}

/// Writes a settings file.
///
/// Data goes to a temporary sibling that replaces `path` only in
/// [`SettingsWriter::finish`]. A writer dropped without finishing, or whose
/// finish fails, removes the temporary file and leaves any previous file
/// untouched.
pub struct SettingsWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    // None once finish has taken it
    writer: Option<BufWriter<File>>,
    committed: bool,
}

impl SettingsWriter {
    pub fn create(path: impl AsRef<Path>, schema_version: u32) -> PersistenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&SETTINGS_MAGIC)?;
        writer.write_u32::<LittleEndian>(schema_version)?;

        Ok(Self {
            path,
            tmp_path,
            writer: Some(writer),
            committed: false,
        })
    }

    fn out(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "settings writer already finished"))
    }

    pub fn write_bool(&mut self, value: bool) -> PersistenceResult<()> {
        self.out()?.write_u8(u8::from(value))?;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> PersistenceResult<()> {
        self.out()?.write_i32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> PersistenceResult<()> {
        self.out()?.write_u32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> PersistenceResult<()> {
        self.out()?.write_f32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> PersistenceResult<()> {
        self.out()?.write_f64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> PersistenceResult<()> {
        write_string(self.out()?, value)?;
        Ok(())
    }

    pub fn write_map(&mut self, map: &ImageMapInformation) -> PersistenceResult<()> {
        write_map(self.out()?, map)?;
        Ok(())
    }

    /// Flush, sync and move the file into place.
    pub fn finish(mut self) -> PersistenceResult<()> {
        let writer = self.writer.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "settings writer already finished")
        })?;
        let file = writer
            .into_inner()
            .map_err(|e| PersistenceError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path)?;
        self.committed = true;
        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}

impl Drop for SettingsWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // close the handle before removing the file
        drop(self.writer.take());
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => debug!(path = %self.path.display(), "Discarded unfinished settings"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.tmp_path.display(),
                error = %e,
                "Failed to remove unfinished settings file"
            ),
        }
    }
}

/// Reads a settings file written by [`SettingsWriter`].
pub struct SettingsReader {
    version: u32,
    reader: BufReader<File>,
}

impl SettingsReader {
    /// Open `path` and require `expected_version`.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    pub fn open(path: impl AsRef<Path>, expected_version: u32) -> PersistenceResult<Option<Self>> {
        match Self::open_any(path)? {
            Some(reader) if reader.version != expected_version => {
                Err(PersistenceError::VersionMismatch {
                    expected: expected_version,
                    found: reader.version,
                })
            }
            other => Ok(other),
        }
    }

    /// Open `path` accepting any schema version, for readers that migrate.
    pub fn open_any(path: impl AsRef<Path>) -> PersistenceResult<Option<Self>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(map_read_err)?;
        if magic != SETTINGS_MAGIC {
            return Err(PersistenceError::BadMagic);
        }
        let version = reader.read_u32::<LittleEndian>().map_err(map_read_err)?;

        Ok(Some(Self { version, reader }))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn read_bool(&mut self) -> PersistenceResult<bool> {
        match self.reader.read_u8().map_err(map_read_err)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PersistenceError::InvalidValue(format!(
                "{} is not a boolean",
                other
            ))),
        }
    }

    pub fn read_i32(&mut self) -> PersistenceResult<i32> {
        self.reader.read_i32::<LittleEndian>().map_err(map_read_err)
    }

    pub fn read_u32(&mut self) -> PersistenceResult<u32> {
        self.reader.read_u32::<LittleEndian>().map_err(map_read_err)
    }

    pub fn read_f32(&mut self) -> PersistenceResult<f32> {
        self.reader.read_f32::<LittleEndian>().map_err(map_read_err)
    }

    pub fn read_f64(&mut self) -> PersistenceResult<f64> {
        self.reader.read_f64::<LittleEndian>().map_err(map_read_err)
    }

    pub fn read_string(&mut self) -> PersistenceResult<String> {
        read_string(&mut self.reader)
    }

    pub fn read_map(&mut self) -> PersistenceResult<ImageMapInformation> {
        read_map(&mut self.reader)
    }
}

/// Decode `path` with `decode`, falling back to `T::default()`.
///
/// A missing file yields the default silently; any decoding error is logged
/// and also yields the default, so a corrupt file never leaks half-read state.
pub fn load_or_default<T, F>(path: &Path, schema_version: u32, decode: F) -> T
where
    T: Default,
    F: FnOnce(&mut SettingsReader) -> PersistenceResult<T>,
{
    let result = SettingsReader::open(path, schema_version)
        .and_then(|reader| reader.map(|mut r| decode(&mut r)).transpose());

    match result {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable settings file");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn sample_map() -> ImageMapInformation {
        ImageMapInformation {
            filename: "venue/main.png".into(),
            filename_intermediate: "venue/main_tmp.jpg".into(),
            filename_mask: "venue/mask.png".into(),
            filename_intermediate_mask: "venue/mask_tmp.jpg".into(),
            latitude: -33.8688,
            longitude: 151.2093,
            coverage_x: 2048.0,
            coverage_z: 2048.0,
            width: 4096,
            height: 4096,
            width_mask: 1024,
            height_mask: 1024,
        }
    }

    #[test]
    fn test_varint_matches_dotnet_encoding() {
        let mut buf = Vec::new();
        write_7bit_len(&mut buf, 300).unwrap();
        assert_eq!(buf, vec![0xAC, 0x02]);

        let mut buf = Vec::new();
        write_7bit_len(&mut buf, 5).unwrap();
        assert_eq!(buf, vec![0x05]);
    }

    #[test]
    fn test_map_wire_layout() {
        let map = sample_map();
        let mut buf = Vec::new();
        write_map(&mut buf, &map).unwrap();

        let strings: usize = [
            &map.filename,
            &map.filename_intermediate,
            &map.filename_mask,
            &map.filename_intermediate_mask,
        ]
        .iter()
        .map(|s| 1 + s.len())
        .sum();
        assert_eq!(buf.len(), strings + 4 * 8 + 4 * 4);

        // latitude immediately follows the four strings
        let lat = f64::from_le_bytes(buf[strings..strings + 8].try_into().unwrap());
        assert_eq!(lat, map.latitude);

        let decoded = read_map(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_truncated_map_is_reported() {
        let mut buf = Vec::new();
        write_map(&mut buf, &sample_map()).unwrap();
        buf.truncate(buf.len() - 3);
        let err = read_map(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, PersistenceError::Truncated));
    }

    #[test]
    fn test_file_round_trip_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Plugins/Height/waves.bin");

        let mut w = SettingsWriter::create(&path, 3).unwrap();
        w.write_f32(250.0).unwrap();
        w.write_bool(true).unwrap();
        w.write_string("héllo").unwrap();
        w.finish().unwrap();

        let mut r = SettingsReader::open(&path, 3).unwrap().unwrap();
        assert_eq!(r.version(), 3);
        assert_eq!(r.read_f32().unwrap(), 250.0);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert!(matches!(r.read_i32(), Err(PersistenceError::Truncated)));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SettingsReader::open(dir.path().join("absent.bin"), 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        SettingsWriter::create(&path, 2).unwrap().finish().unwrap();

        let err = SettingsReader::open(&path, 1).err().unwrap();
        assert!(matches!(
            err,
            PersistenceError::VersionMismatch { expected: 1, found: 2 }
        ));
        assert_eq!(SettingsReader::open_any(&path).unwrap().unwrap().version(), 2);
    }

    #[test]
    fn test_headerless_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.bin");
        fs::write(&path, 100.0f32.to_le_bytes()).unwrap();
        assert!(matches!(
            SettingsReader::open(&path, 1).err().unwrap(),
            PersistenceError::BadMagic
        ));
    }

    #[test]
    fn test_load_or_default_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        SettingsWriter::create(&path, 1).unwrap().finish().unwrap();

        let value: f32 = load_or_default(&path, 1, |r| r.read_f32());
        assert_eq!(value, 0.0);

        let missing: u32 = load_or_default(&dir.path().join("nope.bin"), 1, |r| r.read_u32());
        assert_eq!(missing, 0);
    }

    #[test]
    fn test_abandoned_writer_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.bin");

        let mut w = SettingsWriter::create(&path, 1).unwrap();
        w.write_i32(7).unwrap();
        w.finish().unwrap();

        let mut w = SettingsWriter::create(&path, 1).unwrap();
        w.write_i32(8).unwrap();
        drop(w);

        let mut r = SettingsReader::open(&path, 1).unwrap().unwrap();
        assert_eq!(r.read_i32().unwrap(), 7);
        assert!(!dir.path().join("keep.bin.tmp").exists());
    }

    #[test]
    fn test_abandoned_writer_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Plugins/Image/fresh.bin");

        let mut w = SettingsWriter::create(&path, 1).unwrap();
        w.write_string("half written").unwrap();
        assert!(path.with_file_name("fresh.bin.tmp").is_file());
        drop(w);

        let left: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert!(left.is_empty());

        SettingsWriter::create(&path, 1).unwrap().finish().unwrap();
        let names: Vec<String> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["fresh.bin".to_string()]);
    }

    #[test]
    fn test_oversized_string_rejected() {
        let mut buf = Vec::new();
        write_7bit_len(&mut buf, MAX_STRING_LEN + 1).unwrap();
        assert!(matches!(
            read_string(&mut Cursor::new(buf)),
            Err(PersistenceError::InvalidString(_))
        ));
    }
}
