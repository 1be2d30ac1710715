//! The result database stores rule outcomes across builds so incrementality
//! survives process restarts.
//!
//! Writes are batched between `build_started` and `build_complete`;
//! `build_complete` serializes the whole store to a temporary file and
//! renames it over the database path, so after a crash the next run sees
//! either all of the last build's writes or none of them.

use crate::engine::{Key, RuleResult};
use anyhow::{anyhow, bail, Context};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub trait BuildDb {
    fn current_iteration(&self) -> u64;
    fn set_current_iteration(&mut self, iteration: u64);
    fn lookup_rule_result(&self, key: &Key) -> Option<RuleResult>;
    fn set_rule_result(&mut self, key: &Key, result: &RuleResult) -> anyhow::Result<()>;
    fn build_started(&mut self) -> anyhow::Result<()>;
    fn build_complete(&mut self) -> anyhow::Result<()>;
}

const MAGIC: &[u8; 4] = b"cbdb";
const SCHEMA_VERSION: u32 = 1;

/// File-backed database.  The whole store is held in memory; the file is a
/// snapshot rewritten at the end of each build.
pub struct FileDb {
    path: PathBuf,
    client_version: u32,
    iteration: u64,
    results: HashMap<Key, RuleResult>,
    /// Writes staged during the current build, applied at `build_complete`.
    pending: Vec<(Key, RuleResult)>,
    pending_iteration: Option<u64>,
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_u32(w: &mut impl Write, n: u32) -> std::io::Result<()> {
    w.write_all(&n.to_le_bytes())
}

fn write_u64(w: &mut impl Write, n: u64) -> std::io::Result<()> {
    w.write_all(&n.to_le_bytes())
}

fn write_bytes(w: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)
}

impl FileDb {
    /// Open or create the database at `path`.  `client_version` is an
    /// uninterpreted number for the embedding client; stored state from a
    /// different schema or client version is discarded.
    pub fn open(path: impl Into<PathBuf>, client_version: u32) -> anyhow::Result<FileDb> {
        let path = path.into();
        let mut db = FileDb {
            path: path.clone(),
            client_version,
            iteration: 0,
            results: HashMap::new(),
            pending: Vec::new(),
            pending_iteration: None,
        };
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(db),
            Err(err) => return Err(anyhow!("open {}: {}", path.display(), err)),
        };
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        match r.read_exact(&mut magic) {
            Ok(()) => {}
            // An empty file is as good as a missing one.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(db),
            Err(err) => return Err(err).context(format!("read {}", path.display())),
        }
        if &magic != MAGIC {
            bail!("{}: not a corebuild database", path.display());
        }
        let schema = read_u32(&mut r).context("read schema version")?;
        let client = read_u32(&mut r).context("read client version")?;
        if schema != SCHEMA_VERSION || client != client_version {
            // Stale format; start over rather than guess at migration.
            return Ok(db);
        }

        db.iteration = read_u64(&mut r).context("read iteration")?;
        let count = read_u32(&mut r).context("read result count")?;
        for _ in 0..count {
            let key = Key::new(read_bytes(&mut r).context("read key")?);
            let value = read_bytes(&mut r).context("read value")?;
            let built_at = read_u64(&mut r)?;
            let computed_at = read_u64(&mut r)?;
            let dep_count = read_u32(&mut r)? as usize;
            let mut dependencies = Vec::with_capacity(dep_count);
            for _ in 0..dep_count {
                dependencies.push(Key::new(read_bytes(&mut r).context("read dependency")?));
            }
            db.results.insert(
                key,
                RuleResult {
                    value,
                    dependencies,
                    built_at,
                    computed_at,
                },
            );
        }
        Ok(db)
    }

    fn write_snapshot(&self) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp)
                .map_err(|err| anyhow!("create {}: {}", tmp.display(), err))?;
            let mut w = BufWriter::new(file);
            w.write_all(MAGIC)?;
            write_u32(&mut w, SCHEMA_VERSION)?;
            write_u32(&mut w, self.client_version)?;
            write_u64(&mut w, self.iteration)?;
            write_u32(&mut w, self.results.len() as u32)?;
            for (key, result) in &self.results {
                write_bytes(&mut w, key.as_bytes())?;
                write_bytes(&mut w, &result.value)?;
                write_u64(&mut w, result.built_at)?;
                write_u64(&mut w, result.computed_at)?;
                write_u32(&mut w, result.dependencies.len() as u32)?;
                for dep in &result.dependencies {
                    write_bytes(&mut w, dep.as_bytes())?;
                }
            }
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| anyhow!("rename {}: {}", self.path.display(), err))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BuildDb for FileDb {
    fn current_iteration(&self) -> u64 {
        self.iteration
    }

    fn set_current_iteration(&mut self, iteration: u64) {
        self.pending_iteration = Some(iteration);
    }

    fn lookup_rule_result(&self, key: &Key) -> Option<RuleResult> {
        self.results.get(key).cloned()
    }

    fn set_rule_result(&mut self, key: &Key, result: &RuleResult) -> anyhow::Result<()> {
        self.pending.push((key.clone(), result.clone()));
        Ok(())
    }

    fn build_started(&mut self) -> anyhow::Result<()> {
        self.pending.clear();
        self.pending_iteration = None;
        Ok(())
    }

    fn build_complete(&mut self) -> anyhow::Result<()> {
        for (key, result) in self.pending.drain(..) {
            self.results.insert(key, result);
        }
        if let Some(iteration) = self.pending_iteration.take() {
            self.iteration = iteration;
        }
        self.write_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RuleResult;

    fn sample_result(value: &[u8], deps: &[&str], built_at: u64, computed_at: u64) -> RuleResult {
        RuleResult {
            value: value.to_vec(),
            dependencies: deps.iter().map(|&d| Key::from(d)).collect(),
            built_at,
            computed_at,
        }
    }

    #[test]
    fn roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("build.db");

        let mut db = FileDb::open(&path, 1)?;
        db.build_started()?;
        db.set_rule_result(&Key::from("a"), &sample_result(b"2", &[], 1, 1))?;
        db.set_rule_result(&Key::from("r"), &sample_result(b"30", &["a", "b"], 1, 1))?;
        db.set_current_iteration(1);
        db.build_complete()?;

        let db = FileDb::open(&path, 1)?;
        assert_eq!(db.current_iteration(), 1);
        let r = db.lookup_rule_result(&Key::from("r")).unwrap();
        assert_eq!(r.value, b"30");
        assert_eq!(r.dependencies, vec![Key::from("a"), Key::from("b")]);
        assert_eq!(r.built_at, 1);
        assert!(db.lookup_rule_result(&Key::from("missing")).is_none());
        Ok(())
    }

    #[test]
    fn client_version_mismatch_discards_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("build.db");

        let mut db = FileDb::open(&path, 1)?;
        db.build_started()?;
        db.set_rule_result(&Key::from("a"), &sample_result(b"2", &[], 1, 1))?;
        db.set_current_iteration(1);
        db.build_complete()?;

        let db = FileDb::open(&path, 2)?;
        assert_eq!(db.current_iteration(), 0);
        assert!(db.lookup_rule_result(&Key::from("a")).is_none());
        Ok(())
    }

    #[test]
    fn pending_writes_are_invisible_until_build_complete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("build.db");

        let mut db = FileDb::open(&path, 1)?;
        db.build_started()?;
        db.set_rule_result(&Key::from("a"), &sample_result(b"2", &[], 1, 1))?;
        db.set_current_iteration(1);
        // Simulated crash: drop without build_complete.
        drop(db);

        let db = FileDb::open(&path, 1)?;
        assert_eq!(db.current_iteration(), 0);
        assert!(db.lookup_rule_result(&Key::from("a")).is_none());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("build.db");
        std::fs::write(&path, b"cbdb\x01\x00\x00")?;
        assert!(FileDb::open(&path, 1).is_err());
        Ok(())
    }

    #[test]
    fn not_a_database_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("build.db");
        std::fs::write(&path, b"something else entirely")?;
        assert!(FileDb::open(&path, 1).is_err());
        Ok(())
    }
}
