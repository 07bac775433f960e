//! SQLite snapshot and restore.
//!
//! Each backup carries two copies: a page-level copy taken with the online
//! backup API (fast to restore, same SQLite format) and a logical SQL export
//! that any SQLite version can import.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Result, UpkeepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMethod {
    RawCopy,
    LogicalExport,
}

fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Consistent page-level copy of `db` into `dest`, safe while the service writes.
pub fn snapshot(db: &Path, dest: &Path) -> Result<()> {
    let conn = open_read_only(db)?;
    conn.backup(DatabaseName::Main, dest, None)?;
    Ok(())
}

/// Dump schema and rows of `db` as SQL statements into `dest`.
pub fn export(db: &Path, dest: &Path) -> Result<()> {
    let conn = open_read_only(db)?;
    let mut out = String::from("PRAGMA foreign_keys=OFF;\nBEGIN TRANSACTION;\n");

    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master \
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
         ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, rowid",
    )?;
    let objects = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (kind, name, sql) in &objects {
        writeln!(out, "{sql};").ok();
        if kind == "table" {
            dump_rows(&conn, name, &mut out)?;
        }
    }

    let has_sequence: bool = conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE name = 'sqlite_sequence'",
        [],
        |r| r.get(0),
    )?;
    if has_sequence {
        out.push_str("DELETE FROM sqlite_sequence;\n");
        dump_rows(&conn, "sqlite_sequence", &mut out)?;
    }

    out.push_str("COMMIT;\n");
    crate::io::atomic_write(dest, out.as_bytes())
}

fn dump_rows(conn: &Connection, table: &str, out: &mut String) -> Result<()> {
    let ident = quote_ident(table);
    let mut stmt = conn.prepare(&format!("SELECT * FROM {ident}"))?;
    let columns = stmt.column_count();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns);
        for i in 0..columns {
            values.push(sql_literal(row.get_ref(i)?));
        }
        writeln!(out, "INSERT INTO {ident} VALUES({});", values.join(",")).ok();
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        // SQLite has no literal for infinity; 9e999 overflows to it.
        ValueRef::Real(f) if f.is_nan() => "NULL".to_string(),
        ValueRef::Real(f) if f.is_infinite() => {
            let literal = if f > 0.0 { "9e999" } else { "-9e999" };
            literal.to_string()
        }
        ValueRef::Real(f) => format!("{f:?}"),
        ValueRef::Text(t) => format!("'{}'", String::from_utf8_lossy(t).replace('\'', "''")),
        ValueRef::Blob(b) => {
            let mut hex = String::with_capacity(b.len() * 2 + 3);
            hex.push_str("X'");
            for byte in b {
                write!(hex, "{byte:02x}").ok();
            }
            hex.push('\'');
            hex
        }
    }
}

/// True if `PRAGMA integrity_check` reports `ok`.
pub fn integrity_ok(path: &Path) -> bool {
    let check = || -> Result<bool> {
        let conn = open_read_only(path)?;
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        Ok(verdict == "ok")
    };
    check().unwrap_or(false)
}

/// Replace `target` with the snapshot. Prefers the raw copy; falls back to
/// importing the logical export when the raw copy is missing or damaged.
pub fn restore(target: &Path, raw: &Path, export: &Path) -> Result<RestoreMethod> {
    let dir = target.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = NamedTempFile::new_in(dir)?;

    let method = if raw.exists() && integrity_ok(raw) {
        std::fs::copy(raw, tmp.path())?;
        RestoreMethod::RawCopy
    } else if export.exists() {
        tracing::warn!("raw datastore copy unusable, importing logical export");
        let sql = std::fs::read_to_string(export)?;
        let conn = Connection::open(tmp.path())?;
        conn.execute_batch(&sql)?;
        conn.close().map_err(|(_, e)| UpkeepError::Sqlite(e))?;
        RestoreMethod::LogicalExport
    } else {
        return Err(UpkeepError::OperationFailure {
            step: "RestoreDatastore".into(),
            message: "backup contains no usable datastore copy".into(),
        });
    };

    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = target.as_os_str().to_owned();
        side.push(suffix);
        crate::io::remove_if_exists(Path::new(&side))?;
    }
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE links (id INTEGER PRIMARY KEY AUTOINCREMENT, code TEXT NOT NULL, \
                                 target TEXT, clicks INTEGER, ratio REAL, icon BLOB);
             CREATE UNIQUE INDEX links_code ON links(code);
             INSERT INTO links (code, target, clicks, ratio, icon)
                 VALUES ('abc', 'https://example.com/?q=it''s', 3, 1.0, X'00ff');
             INSERT INTO links (code, target, clicks, ratio, icon)
                 VALUES ('xyz', NULL, 0, 0.25, NULL);",
        )
        .unwrap();
    }

    fn codes(path: &Path) -> Vec<(String, Option<String>, f64)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT code, target, ratio FROM links ORDER BY id")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn raw_snapshot_restores() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("links.db");
        seed(&db);
        let raw = dir.path().join("database.sqlite");
        snapshot(&db, &raw).unwrap();
        assert!(integrity_ok(&raw));

        Connection::open(&db)
            .unwrap()
            .execute("DELETE FROM links", [])
            .unwrap();
        let method = restore(&db, &raw, &dir.path().join("missing.sql")).unwrap();
        assert_eq!(method, RestoreMethod::RawCopy);
        assert_eq!(codes(&db).len(), 2);
    }

    #[test]
    fn export_round_trips_values() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("links.db");
        seed(&db);
        let sql = dir.path().join("database.sql");
        export(&db, &sql).unwrap();
        let dump = std::fs::read_to_string(&sql).unwrap();
        assert!(dump.contains("CREATE TABLE links"));
        assert!(dump.contains("CREATE UNIQUE INDEX links_code"));
        assert!(dump.contains("X'00ff'"));

        // Damaged raw copy forces the logical path.
        let raw = dir.path().join("database.sqlite");
        std::fs::write(&raw, b"not a database").unwrap();
        let method = restore(&db, &raw, &sql).unwrap();
        assert_eq!(method, RestoreMethod::LogicalExport);

        let rows = codes(&db);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1.as_deref(), Some("https://example.com/?q=it's"));
        assert_eq!(rows[0].2, 1.0);
        assert_eq!(rows[1].1, None);

        // AUTOINCREMENT counter survives the export.
        let conn = Connection::open(&db).unwrap();
        conn.execute("INSERT INTO links (code) VALUES ('new')", [])
            .unwrap();
        assert_eq!(conn.last_insert_rowid(), 3);
    }

    #[test]
    fn infinite_reals_survive_the_export() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("links.db");
        seed(&db);
        Connection::open(&db)
            .unwrap()
            .execute_batch(
                "INSERT INTO links (code, ratio) VALUES ('up', 9e999);
                 INSERT INTO links (code, ratio) VALUES ('down', -9e999);",
            )
            .unwrap();
        let sql = dir.path().join("database.sql");
        export(&db, &sql).unwrap();

        let raw = dir.path().join("database.sqlite");
        std::fs::write(&raw, b"not a database").unwrap();
        assert_eq!(restore(&db, &raw, &sql).unwrap(), RestoreMethod::LogicalExport);

        let rows = codes(&db);
        assert_eq!(rows[2].2, f64::INFINITY);
        assert_eq!(rows[3].2, f64::NEG_INFINITY);
        assert_eq!(sql_literal(ValueRef::Real(f64::NAN)), "NULL");
    }

    #[test]
    fn restore_without_copies_fails() {
        let dir = TempDir::new().unwrap();
        let err = restore(
            &dir.path().join("links.db"),
            &dir.path().join("a"),
            &dir.path().join("b"),
        )
        .unwrap_err();
        assert!(matches!(err, UpkeepError::OperationFailure { .. }));
    }
}
