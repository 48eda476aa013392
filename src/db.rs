//! The result database stores the outcome of previous builds for
//! determining which work is up to date.
//!
//! On disk it is an append-only log of records behind a small versioned
//! header; on load the last record per key wins.  There is no recovery and
//! no migration: a header from another schema version, or any undecodable
//! record, re-initializes the database and the next build starts cold.

use crate::key::BuildKey;
use crate::value::BuildValue;
use anyhow::bail;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};

const MAGIC: &[u8; 8] = b"gristdb\n";
const FORMAT_VERSION: u32 = 1;

/// One stored result: the value computed for a key, the keys it depended
/// on, and the build timestamps used for dependency scanning.
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub value: BuildValue,
    pub deps: Vec<BuildKey>,
    /// The build iteration this result was last brought up to date in.
    pub built_at: u64,
    /// The build iteration the value last actually changed in.  Preserved
    /// across runs that recompute an identical value, which is what lets
    /// dependents stay clean.
    pub computed_at: u64,
}

/// An opened database, ready for lookups and appends.
pub struct Db {
    w: BufWriter<File>,
    records: HashMap<Vec<u8>, StoredResult>,
    /// The current build iteration: one past the newest stored `built_at`.
    pub epoch: u64,
}

impl Db {
    /// Open or create the database at `path` for the given client schema
    /// version.
    pub fn open(path: &str, schema_version: u32) -> anyhow::Result<Db> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => bail!("read {}: {}", path, err),
        };

        let (records, reinitialize) = match parse_records(&bytes, schema_version) {
            Some(records) => (records, false),
            None => (HashMap::new(), true),
        };

        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        if reinitialize {
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.write_all(&FORMAT_VERSION.to_le_bytes())?;
            file.write_all(&schema_version.to_le_bytes())?;
            file.flush()?;
        } else {
            file.seek(SeekFrom::End(0))?;
        }

        let epoch = records.values().map(|r| r.built_at).max().unwrap_or(0) + 1;
        Ok(Db {
            w: BufWriter::new(file),
            records,
            epoch,
        })
    }

    pub fn lookup(&self, key: &BuildKey) -> Option<&StoredResult> {
        self.records.get(&key.encode())
    }

    pub fn write(&mut self, key: &BuildKey, result: StoredResult) -> anyhow::Result<()> {
        debug_assert!(!result.value.is_invalid());
        let key_bytes = key.encode();
        write_vec(&mut self.w, &key_bytes)?;
        write_vec(&mut self.w, &result.value.encode())?;
        self.w.write_all(&(result.deps.len() as u32).to_le_bytes())?;
        for dep in &result.deps {
            write_vec(&mut self.w, &dep.encode())?;
        }
        self.w.write_all(&result.built_at.to_le_bytes())?;
        self.w.write_all(&result.computed_at.to_le_bytes())?;
        self.w.flush()?;
        self.records.insert(key_bytes, result);
        Ok(())
    }
}

fn write_vec(w: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

/// Decode the whole log; None means the database cannot be used as-is and
/// must be re-initialized.
fn parse_records(
    bytes: &[u8],
    schema_version: u32,
) -> Option<HashMap<Vec<u8>, StoredResult>> {
    let mut r = RecordReader { buf: bytes, ofs: 0 };
    if r.bytes(8)? != MAGIC {
        return None;
    }
    if r.u32()? != FORMAT_VERSION || r.u32()? != schema_version {
        return None;
    }

    let mut records = HashMap::new();
    while !r.at_end() {
        let key = r.vec()?;
        let value = BuildValue::decode(r.vec()?).ok()?;
        let dep_count = r.u32()?;
        let mut deps = Vec::new();
        for _ in 0..dep_count {
            deps.push(BuildKey::decode(r.vec()?).ok()?);
        }
        let built_at = r.u64()?;
        let computed_at = r.u64()?;
        records.insert(
            key.to_vec(),
            StoredResult {
                value,
                deps,
                built_at,
                computed_at,
            },
        );
    }
    Some(records)
}

/// Provides lower-level methods for reading serialized data.
struct RecordReader<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> RecordReader<'a> {
    fn at_end(&self) -> bool {
        self.ofs == self.buf.len()
    }
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.ofs..self.ofs.checked_add(n)?)?;
        self.ofs += n;
        Some(bytes)
    }
    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
    fn vec(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileInfo;

    fn temp_db_path(name: &str) -> String {
        let dir = std::env::temp_dir().join("grist-db-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path.to_str().unwrap().to_string()
    }

    fn sample_result(built_at: u64) -> StoredResult {
        StoredResult {
            value: BuildValue::SuccessfulCommand {
                signature: 42,
                outputs: vec![FileInfo::Missing],
            },
            deps: vec![BuildKey::node("a.in"), BuildKey::node("<x>")],
            built_at,
            computed_at: built_at,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let path = temp_db_path("reopen");
        {
            let mut db = Db::open(&path, 0).unwrap();
            assert_eq!(db.epoch, 1);
            db.write(&BuildKey::command("cc"), sample_result(1)).unwrap();
        }
        let db = Db::open(&path, 0).unwrap();
        assert_eq!(db.epoch, 2);
        let stored = db.lookup(&BuildKey::command("cc")).unwrap();
        assert_eq!(stored.deps.len(), 2);
        assert!(matches!(
            stored.value,
            BuildValue::SuccessfulCommand { signature: 42, .. }
        ));
        assert!(db.lookup(&BuildKey::command("link")).is_none());
    }

    #[test]
    fn last_record_wins() {
        let path = temp_db_path("rewrite");
        {
            let mut db = Db::open(&path, 0).unwrap();
            db.write(&BuildKey::node("n"), sample_result(1)).unwrap();
            db.write(&BuildKey::node("n"), sample_result(3)).unwrap();
        }
        let db = Db::open(&path, 0).unwrap();
        assert_eq!(db.lookup(&BuildKey::node("n")).unwrap().built_at, 3);
        assert_eq!(db.epoch, 4);
    }

    #[test]
    fn schema_version_mismatch_reinitializes() {
        let path = temp_db_path("schema");
        {
            let mut db = Db::open(&path, 0).unwrap();
            db.write(&BuildKey::node("n"), sample_result(1)).unwrap();
        }
        let db = Db::open(&path, 1).unwrap();
        assert!(db.lookup(&BuildKey::node("n")).is_none());
        assert_eq!(db.epoch, 1);
    }

    #[test]
    fn corrupt_log_reinitializes() {
        let path = temp_db_path("corrupt");
        {
            let mut db = Db::open(&path, 0).unwrap();
            db.write(&BuildKey::node("n"), sample_result(1)).unwrap();
        }
        // Truncate mid-record.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let db = Db::open(&path, 0).unwrap();
        assert!(db.lookup(&BuildKey::node("n")).is_none());
    }
}
