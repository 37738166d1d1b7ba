//! Persisted configuration snapshots.
//!
//! ## Snapshot Format
//!
//! All integers are little-endian.
//!
//! | Field        | Size | Description                       |
//! |--------------|------|-----------------------------------|
//! | magic        | 4    | `MGCF`                            |
//! | version      | 2    | Format version (1..=4)            |
//! | serial       | 4    | Bumped on every persisted change  |
//! | controller   | 1    | Coordinator unit id               |
//! | unit count   | 2    |                                   |
//! | units        | var  | One unit record each              |
//!
//! Unit record:
//!
//! ```text
//! id u8, name_len u16, name utf-8, generic u8, specific u8, state u8,
//! [v2+] listening u8,
//! binding count, bindings (class u8, instance u8, [v2+] secure u8),
//! group count, groups (group u8, target count, targets u8..),
//! [v3+] parameter count, parameters (number u8, width u8, value i32),
//! [v3+] has_interval u8, interval u32
//! ```
//!
//! Counts are `u8` up to version 3 and `u16` from version 4 on, since a unit
//! may hold all 256 parameter numbers. Older versions cannot be written for
//! a directory whose counts do not fit.
//!
//! The magic, version and serial never move, so [`Snapshot::peek_serial`]
//! can read the serial of a snapshot written by a newer version.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use meshgate_classes::{AssociationGroup, CommandClassBinding, ConfigParameter};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::LegacySecurePolicy;
use crate::directory::{Directory, Unit, UnitState};
use crate::error::ConfigError;

/// Snapshot magic bytes.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"MGCF";

/// Newest snapshot version written and read.
pub const SNAPSHOT_VERSION: u16 = 4;

/// First version with 16-bit counts.
const WIDE_COUNTS: u16 = 4;

/// Persisted driver configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Change serial.
    pub serial: u32,
    /// Coordinator unit id.
    pub controller_id: u8,
    /// Units without transient state.
    pub directory: Directory,
}

impl Snapshot {
    /// Create a snapshot.
    pub fn new(serial: u32, controller_id: u8, directory: Directory) -> Self {
        Snapshot {
            serial,
            controller_id,
            directory,
        }
    }

    /// Encode in the newest format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.directory.len() * 32);
        self.write(&mut buf, SNAPSHOT_VERSION);
        buf
    }

    /// Encode in an older format. Fields the version lacks are omitted.
    pub fn encode_version(&self, version: u16) -> Result<Vec<u8>, ConfigError> {
        if version == 0 || version > SNAPSHOT_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                newest: SNAPSHOT_VERSION,
            });
        }
        if version < WIDE_COUNTS {
            if let Some(unit) = self.directory.iter().find(|u| !fits_narrow_counts(u)) {
                return Err(ConfigError::Invalid(format!(
                    "unit {} does not fit snapshot version {}",
                    unit.id, version
                )));
            }
        }
        let mut buf = Vec::new();
        self.write(&mut buf, version);
        Ok(buf)
    }

    /// Serial of any snapshot, including versions this build cannot decode.
    pub fn peek_serial(bytes: &[u8]) -> Option<u32> {
        let mut r = Reader { buf: bytes };
        if r.take(4, "magic").ok()? != SNAPSHOT_MAGIC {
            return None;
        }
        r.u16("version").ok()?;
        r.u32("serial").ok()
    }

    fn write(&self, buf: &mut Vec<u8>, version: u16) {
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.put_u16_le(version);
        buf.put_u32_le(self.serial);
        buf.put_u8(self.controller_id);
        buf.put_u16_le(self.directory.len() as u16);

        for unit in self.directory.iter() {
            buf.put_u8(unit.id);
            buf.put_u16_le(unit.name.len() as u16);
            buf.extend_from_slice(unit.name.as_bytes());
            buf.put_u8(unit.generic);
            buf.put_u8(unit.specific);
            buf.put_u8(unit.state.code());
            if version >= 2 {
                buf.put_u8(unit.listening as u8);
            }

            put_count(buf, version, unit.bindings.len());
            for binding in &unit.bindings {
                buf.put_u8(binding.class);
                buf.put_u8(binding.instance);
                if version >= 2 {
                    buf.put_u8(binding.secure as u8);
                }
            }

            put_count(buf, version, unit.associations.len());
            for group in unit.associations.values() {
                buf.put_u8(group.group);
                put_count(buf, version, group.targets.len());
                buf.extend_from_slice(&group.targets);
            }

            if version >= 3 {
                put_count(buf, version, unit.config.len());
                for param in unit.config.values() {
                    buf.put_u8(param.number);
                    buf.put_u8(param.width);
                    buf.put_i32_le(param.value);
                }
                match unit.wakeup_interval {
                    Some(seconds) => {
                        buf.put_u8(1);
                        buf.put_u32_le(seconds);
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_u32_le(0);
                    }
                }
            }
        }
    }

    /// Decode any supported version.
    ///
    /// Bindings from snapshots older than version 2 carry no secure flag;
    /// `policy` decides how they are read.
    pub fn decode(bytes: &[u8], policy: LegacySecurePolicy) -> Result<Snapshot, ConfigError> {
        let mut r = Reader { buf: bytes };
        let magic = r.take(4, "magic")?;
        if magic != SNAPSHOT_MAGIC {
            return Err(ConfigError::BadMagic);
        }
        let version = r.u16("version")?;
        if version == 0 || version > SNAPSHOT_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                newest: SNAPSHOT_VERSION,
            });
        }
        let serial = r.u32("serial")?;
        let controller_id = r.u8("controller id")?;
        let count = r.u16("unit count")?;

        let mut directory = Directory::new();
        for _ in 0..count {
            let unit = read_unit(&mut r, version, policy)?;
            if directory.insert(unit).is_some() {
                return Err(ConfigError::Invalid("unit listed twice".into()));
            }
        }
        if let Some(name) = directory.duplicate_name() {
            return Err(ConfigError::DuplicateName(name.to_string()));
        }
        if r.buf.has_remaining() {
            debug!("ignoring {} trailing snapshot bytes", r.buf.remaining());
        }

        Ok(Snapshot {
            serial,
            controller_id,
            directory,
        })
    }
}

fn fits_narrow_counts(unit: &Unit) -> bool {
    let max = u8::MAX as usize;
    unit.bindings.len() <= max
        && unit.associations.len() <= max
        && unit.associations.values().all(|g| g.targets.len() <= max)
        && unit.config.len() <= max
}

fn put_count(buf: &mut Vec<u8>, version: u16, count: usize) {
    if version >= WIDE_COUNTS {
        buf.put_u16_le(count as u16);
    } else {
        buf.put_u8(count as u8);
    }
}

fn read_unit(r: &mut Reader<'_>, version: u16, policy: LegacySecurePolicy) -> Result<Unit, ConfigError> {
    let id = r.u8("unit id")?;
    if id == 0 {
        return Err(ConfigError::Invalid("unit id 0".into()));
    }
    let mut unit = Unit::new(id);

    let name_len = r.u16("name length")? as usize;
    let name = r.take(name_len, "name")?;
    unit.name = String::from_utf8(name.to_vec())
        .map_err(|_| ConfigError::Invalid(format!("unit {} name is not utf-8", id)))?;
    unit.generic = r.u8("generic type")?;
    unit.specific = r.u8("specific type")?;
    let state = r.u8("state")?;
    unit.state = UnitState::from_code(state)
        .ok_or_else(|| ConfigError::Invalid(format!("unit {} state {}", id, state)))?;
    if version >= 2 {
        unit.listening = r.u8("listening flag")? != 0;
    }

    let bindings = r.count(version, "binding count")?;
    for _ in 0..bindings {
        let class = r.u8("binding class")?;
        let instance = r.u8("binding instance")?;
        let secure = if version >= 2 {
            r.u8("secure flag")? != 0
        } else {
            policy == LegacySecurePolicy::AssumeSecure
        };
        unit.bindings
            .push(CommandClassBinding::with_instance(class, instance, secure));
    }

    let groups = r.count(version, "group count")?;
    for _ in 0..groups {
        let number = r.u8("group number")?;
        let count = r.count(version, "target count")?;
        let mut group = AssociationGroup::new(number);
        for target in r.take(count, "targets")? {
            group.add(*target);
        }
        unit.associations.insert(number, group);
    }

    if version >= 3 {
        let params = r.count(version, "parameter count")?;
        for _ in 0..params {
            let number = r.u8("parameter number")?;
            let width = r.u8("parameter width")?;
            let value = r.i32("parameter value")?;
            let param = ConfigParameter::new(number, width, value as i64)
                .map_err(|e| ConfigError::Invalid(format!("unit {}: {}", id, e)))?;
            unit.config.insert(number, param);
        }
        let has_interval = r.u8("wake-up flag")? != 0;
        let seconds = r.u32("wake-up interval")?;
        unit.wakeup_interval = has_interval.then_some(seconds);
    }

    if version < 2 && policy == LegacySecurePolicy::Reinterview && unit.state != UnitState::Dead {
        unit.reset_interview();
        unit.state = UnitState::New;
    }
    Ok(unit)
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &'static str) -> Result<(), ConfigError> {
        if self.buf.remaining() < n {
            return Err(ConfigError::Truncated(what));
        }
        Ok(())
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ConfigError> {
        self.need(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ConfigError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ConfigError> {
        self.need(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ConfigError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn count(&mut self, version: u16, what: &'static str) -> Result<usize, ConfigError> {
        if version >= WIDE_COUNTS {
            Ok(self.u16(what)? as usize)
        } else {
            Ok(self.u8(what)? as usize)
        }
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, ConfigError> {
        self.need(4, what)?;
        Ok(self.buf.get_i32_le())
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Where snapshots live.
pub trait SnapshotStore: Send + Sync {
    /// Read the stored snapshot bytes, or `None` if nothing was saved yet.
    fn load_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError>;

    /// Replace the stored snapshot.
    fn save_bytes(&self, bytes: &[u8]) -> Result<(), ConfigError>;

    /// Set aside stored bytes that could not be decoded, before they are
    /// replaced.
    fn backup_bytes(&self, bytes: &[u8]) -> Result<(), ConfigError>;

    /// Load and decode the stored snapshot.
    fn load(&self, policy: LegacySecurePolicy) -> Result<Option<Snapshot>, ConfigError> {
        match self.load_bytes()? {
            Some(bytes) => Snapshot::decode(&bytes, policy).map(Some),
            None => Ok(None),
        }
    }

    /// Encode and store a snapshot.
    fn save(&self, snapshot: &Snapshot) -> Result<(), ConfigError> {
        self.save_bytes(&snapshot.encode())
    }
}

/// Snapshot kept in a file. Writes go through a temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    /// Snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where undecodable snapshots are set aside: the snapshot path plus `.bak`.
    pub fn backup_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".bak");
        PathBuf::from(path)
    }
}

impl SnapshotStore for FileStore {
    fn load_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_bytes(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("saved {} snapshot bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }

    fn backup_bytes(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        let backup = self.backup_path();
        std::fs::write(&backup, bytes)?;
        debug!("kept {} snapshot bytes in {}", bytes.len(), backup.display());
        Ok(())
    }
}

/// Snapshot kept in memory. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
    backup: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with bytes.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        MemoryStore {
            slot: Arc::new(Mutex::new(Some(bytes))),
            backup: Arc::default(),
        }
    }

    /// Current bytes.
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.slot.lock().clone()
    }

    /// Bytes set aside by the last backup.
    pub fn backup(&self) -> Option<Vec<u8>> {
        self.backup.lock().clone()
    }
}

impl SnapshotStore for MemoryStore {
    fn load_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        Ok(self.slot.lock().clone())
    }

    fn save_bytes(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        *self.slot.lock() = Some(bytes.to_vec());
        Ok(())
    }

    fn backup_bytes(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        *self.backup.lock() = Some(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_classes::{CLASS_ASSOCIATION, CLASS_BINARY_SWITCH, CLASS_WAKE_UP};

    fn sample() -> Snapshot {
        let mut dir = Directory::new();

        let mut lamp = Unit::new(2);
        lamp.name = "Lamp".into();
        lamp.generic = 0x10;
        lamp.specific = 0x01;
        lamp.state = UnitState::Ready;
        lamp.bindings.push(CommandClassBinding::new(CLASS_BINARY_SWITCH, false));
        lamp.bindings.push(CommandClassBinding::new(CLASS_ASSOCIATION, true));
        let mut group = AssociationGroup::new(1);
        group.add(1);
        group.add(5);
        lamp.associations.insert(1, group);
        lamp.config
            .insert(3, ConfigParameter::new(3, 2, -300).expect("valid parameter"));
        dir.insert(lamp);

        let mut sensor = Unit::new(5);
        sensor.state = UnitState::Dead;
        sensor.listening = false;
        sensor.bindings.push(CommandClassBinding::new(CLASS_WAKE_UP, false));
        sensor.wakeup_interval = Some(3600);
        dir.insert(sensor);

        Snapshot::new(7, 1, dir)
    }

    #[test]
    fn test_current_version_round_trip() {
        let snapshot = sample();
        let bytes = snapshot.encode();
        assert_eq!(&bytes[..4], b"MGCF");
        let decoded = Snapshot::decode(&bytes, LegacySecurePolicy::default()).expect("should decode");
        assert_eq!(decoded.serial, 7);
        assert!(decoded.directory.persisted_eq(&snapshot.directory));
    }

    #[test]
    fn test_version_1_defaults() {
        let bytes = sample().encode_version(1).expect("should encode");

        let plain = Snapshot::decode(&bytes, LegacySecurePolicy::AssumeInsecure).expect("should decode");
        let lamp = plain.directory.get(2).unwrap();
        assert!(lamp.bindings.iter().all(|b| !b.secure));
        assert!(lamp.config.is_empty());
        assert!(plain.directory.get(5).unwrap().listening);
        assert_eq!(plain.directory.get(5).unwrap().wakeup_interval, None);

        let secure = Snapshot::decode(&bytes, LegacySecurePolicy::AssumeSecure).expect("should decode");
        assert!(secure.directory.get(2).unwrap().bindings.iter().all(|b| b.secure));

        let again = Snapshot::decode(&bytes, LegacySecurePolicy::Reinterview).expect("should decode");
        let lamp = again.directory.get(2).unwrap();
        assert_eq!(lamp.state, UnitState::New);
        assert!(lamp.bindings.is_empty());
        assert_eq!(lamp.name, "Lamp");
        assert_eq!(lamp.associations.len(), 1);
        assert_eq!(again.directory.get(5).unwrap().state, UnitState::Dead);
    }

    #[test]
    fn test_version_2_keeps_secure_flag() {
        let bytes = sample().encode_version(2).expect("should encode");
        let decoded = Snapshot::decode(&bytes, LegacySecurePolicy::AssumeInsecure).expect("should decode");
        let lamp = decoded.directory.get(2).unwrap();
        assert!(lamp.bindings[1].secure);
        assert!(lamp.config.is_empty());
        assert!(!decoded.directory.get(5).unwrap().listening);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut bytes = sample().encode();
        assert_eq!(
            Snapshot::decode(&bytes[..bytes.len() - 3], LegacySecurePolicy::default()),
            Err(ConfigError::Truncated("wake-up interval"))
        );

        bytes[4] = 9;
        assert_eq!(
            Snapshot::decode(&bytes, LegacySecurePolicy::default()),
            Err(ConfigError::UnsupportedVersion {
                found: 9,
                newest: SNAPSHOT_VERSION
            })
        );

        assert_eq!(
            Snapshot::decode(b"XXXX\x01\x00", LegacySecurePolicy::default()),
            Err(ConfigError::BadMagic)
        );
        assert_eq!(
            Snapshot::decode(b"MG", LegacySecurePolicy::default()),
            Err(ConfigError::Truncated("magic"))
        );
    }

    #[test]
    fn test_every_parameter_number_survives() {
        let mut snapshot = sample();
        let lamp = snapshot.directory.get_mut(2).unwrap();
        for number in 0..=u8::MAX {
            lamp.config
                .insert(number, ConfigParameter::new(number, 1, -1).unwrap());
        }
        let decoded = Snapshot::decode(&snapshot.encode(), LegacySecurePolicy::default()).unwrap();
        assert_eq!(decoded.directory.get(2).unwrap().config.len(), 256);
        assert!(decoded.directory.persisted_eq(&snapshot.directory));

        assert!(matches!(
            snapshot.encode_version(3),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_version_3_still_reads() {
        let bytes = sample().encode_version(3).unwrap();
        let decoded = Snapshot::decode(&bytes, LegacySecurePolicy::default()).unwrap();
        assert!(decoded.directory.persisted_eq(&sample().directory));
    }

    #[test]
    fn test_peek_serial_reads_newer_versions() {
        let mut bytes = sample().encode();
        bytes[4] = (SNAPSHOT_VERSION + 1) as u8;
        assert!(Snapshot::decode(&bytes, LegacySecurePolicy::default()).is_err());
        assert_eq!(Snapshot::peek_serial(&bytes), Some(7));
        assert_eq!(Snapshot::peek_serial(b"XXXX\x01\x00\x07\x00\x00\x00"), None);
        assert_eq!(Snapshot::peek_serial(b"MGCF\x01\x00"), None);
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut snapshot = sample();
        snapshot.directory.get_mut(5).unwrap().name = "Lamp".into();
        assert_eq!(
            Snapshot::decode(&snapshot.encode(), LegacySecurePolicy::default()),
            Err(ConfigError::DuplicateName("Lamp".into()))
        );
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let store = FileStore::new(dir.path().join("meshgate.cfg"));
        assert_eq!(store.load(LegacySecurePolicy::default()), Ok(None));

        store.save(&sample()).expect("should save");
        let loaded = store
            .load(LegacySecurePolicy::default())
            .expect("should load")
            .expect("should exist");
        assert_eq!(loaded.serial, 7);
        assert_eq!(loaded.directory.len(), 2);

        store.backup_bytes(b"MGCF old").expect("should back up");
        assert_eq!(store.backup_path(), dir.path().join("meshgate.cfg.bak"));
        assert_eq!(std::fs::read(store.backup_path()).unwrap(), b"MGCF old".to_vec());
        assert_eq!(store.load(LegacySecurePolicy::default()).unwrap().unwrap().serial, 7);
    }

    #[test]
    fn test_memory_store_clones_share_slot() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.save(&sample()).expect("should save");
        assert_eq!(other.bytes(), Some(sample().encode()));
    }
}
