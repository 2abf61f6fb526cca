// ABOUTME: Pure builders for every pg_dump, pg_restore and psql call a clone makes
// ABOUTME: No I/O here, so argument lists can be asserted on directly

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::ident::{quote_literal, QualifiedName};
use crate::models::{CloneType, ConnectionProfile};
use crate::process::Invocation;

/// Dollar-quote tag for generated DO blocks; plain `$$` could collide with a
/// table name.
const DO_TAG: &str = "$pgclone$";

/// Session settings applied before a plain-format data load.
const BULK_LOAD_SETTINGS: &str = "SET synchronous_commit = off; \
     SET work_mem = '256MB'; \
     SET maintenance_work_mem = '512MB'; \
     SET session_replication_role = replica;";

/// Archive format for the source dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    /// `-Fc`, restored by pg_restore in parallel.
    Custom,
    /// `-Fp` SQL script, replayed by psql.
    Plain,
}

impl DumpFormat {
    pub fn for_clone(clone_type: CloneType) -> Self {
        match clone_type {
            CloneType::Data => DumpFormat::Plain,
            CloneType::Structure | CloneType::Both => DumpFormat::Custom,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            DumpFormat::Custom => "source.dump",
            DumpFormat::Plain => "source.sql",
        }
    }
}

fn with_connection(invocation: Invocation, profile: &ConnectionProfile) -> Invocation {
    invocation
        .arg("-d")
        .arg(profile.conninfo())
        .envs(profile.libpq_env())
}

fn file_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<database>_<profile id>_backup_<YYYYmmdd_HHMMSS>_<run>.sql`, with
/// anything unsafe for a file name replaced. The run id fragment keeps two
/// runs in the same second apart.
pub fn backup_file_name(
    destination: &ConnectionProfile,
    run_id: &str,
    started_at: DateTime<Utc>,
) -> String {
    let run: String = run_id.chars().take(8).collect();
    format!(
        "{}_{}_backup_{}_{}.sql",
        file_safe(&destination.database),
        file_safe(&destination.id),
        started_at.format("%Y%m%d_%H%M%S"),
        file_safe(&run)
    )
}

/// Plain-SQL dump of the destination taken before anything is touched.
pub fn backup_dump(pg_dump: &Path, destination: &ConnectionProfile, path: &Path) -> Invocation {
    with_connection(Invocation::new("pg_dump", pg_dump), destination)
        .args(["-Fp", "-f"])
        .arg(path.to_string_lossy())
}

/// SQL that empties the destination before a restore.
///
/// Structure clones drop every non-system schema and recreate `public`.
/// Data-only clones truncate every user table except the excluded ones,
/// in one statement so foreign keys between truncated tables are satisfied.
/// `CASCADE` is only used when nothing is excluded, so an excluded table is
/// never emptied through a foreign key.
pub fn clean_sql(clone_type: CloneType, excluded: &[QualifiedName]) -> String {
    if clone_type.includes_structure() {
        return format!(
            "DO {tag}
DECLARE
    r RECORD;
BEGIN
    FOR r IN
        SELECT n.nspname
        FROM pg_namespace n
        WHERE n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast', 'public')
          AND n.nspname NOT LIKE 'pg_temp_%'
          AND n.nspname NOT LIKE 'pg_toast_temp_%'
          AND NOT EXISTS (SELECT 1 FROM pg_extension e WHERE e.extnamespace = n.oid)
    LOOP
        EXECUTE format('DROP SCHEMA %I CASCADE', r.nspname);
    END LOOP;
END {tag};
DROP SCHEMA IF EXISTS public CASCADE;
CREATE SCHEMA public;",
            tag = DO_TAG
        );
    }

    let exclusion = if excluded.is_empty() {
        String::new()
    } else {
        let names: Vec<String> = excluded
            .iter()
            .map(|name| quote_literal(&name.to_string()))
            .collect();
        format!(
            "\n          AND format('%s.%s', schemaname, tablename) NOT IN ({})",
            names.join(", ")
        )
    };
    let cascade = if excluded.is_empty() { " CASCADE" } else { "" };

    format!(
        "DO {tag}
DECLARE
    targets text;
BEGIN
    SELECT string_agg(format('%I.%I', schemaname, tablename), ', ')
        INTO targets
        FROM pg_tables
        WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
          AND schemaname NOT LIKE 'pg_temp_%'
          AND schemaname NOT LIKE 'pg_toast%'{exclusion};
    IF targets IS NOT NULL THEN
        EXECUTE 'TRUNCATE TABLE ' || targets || '{cascade}';
    END IF;
END {tag};",
        tag = DO_TAG,
        exclusion = exclusion,
        cascade = cascade
    )
}

pub fn clean(psql: &Path, destination: &ConnectionProfile, sql: &str) -> Invocation {
    with_connection(Invocation::new("psql", psql), destination)
        .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-c"])
        .arg(sql)
}

/// Source dump for the requested clone type. Excluded tables are left out
/// of the archive entirely, so the restore never sees them.
pub fn source_dump(
    pg_dump: &Path,
    source: &ConnectionProfile,
    clone_type: CloneType,
    excluded: &[QualifiedName],
    path: &Path,
) -> Invocation {
    let mut invocation = with_connection(Invocation::new("pg_dump", pg_dump), source);
    invocation = match DumpFormat::for_clone(clone_type) {
        DumpFormat::Custom => invocation.args(["-Fc", "-Z", "1"]),
        DumpFormat::Plain => invocation.arg("-Fp"),
    };
    invocation = match clone_type {
        CloneType::Structure => invocation.arg("--schema-only"),
        CloneType::Data => invocation.args(["--data-only", "--disable-triggers"]),
        CloneType::Both => invocation,
    };
    for table in excluded {
        invocation = invocation.arg("--exclude-table").arg(table.dump_pattern());
    }
    invocation.arg("-v").arg("-f").arg(path.to_string_lossy())
}

/// Parallel restore of a custom-format archive. Ownership and grants are
/// left to the destination's own roles.
pub fn restore_archive(
    pg_restore: &Path,
    destination: &ConnectionProfile,
    archive: &Path,
    jobs: usize,
) -> Invocation {
    with_connection(Invocation::new("pg_restore", pg_restore), destination)
        .arg("-j")
        .arg(jobs.max(1).to_string())
        .args(["--no-owner", "--no-privileges", "-v"])
        .arg(archive.to_string_lossy())
}

/// Replays a plain SQL dump, stopping at the first error.
pub fn restore_plain(psql: &Path, destination: &ConnectionProfile, script: &Path) -> Invocation {
    with_connection(Invocation::new("psql", psql), destination)
        .args(["-X", "-v", "ON_ERROR_STOP=1", "-c", BULK_LOAD_SETTINGS, "-f"])
        .arg(script.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn profile(database: &str) -> ConnectionProfile {
        ConnectionProfile {
            id: "dst".to_string(),
            name: "Staging".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            database: database.to_string(),
            user: "postgres".to_string(),
            password: "secret".to_string(),
            ssl: false,
            tag_id: None,
        }
    }

    #[test]
    fn test_backup_file_name() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            backup_file_name(&profile("shop"), "0123456789abcdef", ts),
            "shop_dst_backup_20240309_140507_01234567.sql"
        );
        assert_eq!(
            backup_file_name(&profile("my db/../x"), "0123456789abcdef", ts),
            "my_db_.._x_dst_backup_20240309_140507_01234567.sql"
        );
    }

    #[test]
    fn test_backup_file_names_do_not_collide() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let staging = profile("shop");
        let mut other_host = profile("shop");
        other_host.id = "dst-eu".to_string();
        other_host.host = "eu.db.internal".to_string();

        let first = backup_file_name(&staging, "aaaaaaaa11", ts);
        assert_ne!(first, backup_file_name(&other_host, "aaaaaaaa11", ts));
        assert_ne!(first, backup_file_name(&staging, "bbbbbbbb22", ts));
    }

    #[test]
    fn test_source_dump_structure_excludes_tables() {
        let excluded = vec![
            QualifiedName::new("public", "audit_log"),
            QualifiedName::new("Sales", "Big Table"),
        ];
        let inv = source_dump(
            Path::new("/usr/bin/pg_dump"),
            &profile("shop"),
            CloneType::Structure,
            &excluded,
            Path::new("/tmp/source.dump"),
        );
        assert_eq!(inv.tool, "pg_dump");
        assert!(inv.has_arg("--schema-only"));
        assert!(inv.has_arg("-Fc"));
        assert_eq!(inv.arg_value("-Z"), Some("1"));
        assert_eq!(inv.arg_value("-f"), Some("/tmp/source.dump"));
        let patterns: Vec<&str> = inv
            .args
            .windows(2)
            .filter(|w| w[0] == "--exclude-table")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(patterns, vec!["\"public\".\"audit_log\"", "\"Sales\".\"Big Table\""]);
        assert!(inv.envs.iter().any(|(k, v)| k == "PGPASSWORD" && v == "secret"));
    }

    #[test]
    fn test_source_dump_data_only_is_plain() {
        let inv = source_dump(
            Path::new("pg_dump"),
            &profile("shop"),
            CloneType::Data,
            &[],
            Path::new("/tmp/source.sql"),
        );
        assert!(inv.has_arg("-Fp"));
        assert!(inv.has_arg("--data-only"));
        assert!(inv.has_arg("--disable-triggers"));
        assert!(!inv.has_arg("--schema-only"));
        assert!(!inv.has_arg("--exclude-table"));
    }

    #[test]
    fn test_source_dump_both_has_no_section_flag() {
        let inv = source_dump(
            Path::new("pg_dump"),
            &profile("shop"),
            CloneType::Both,
            &[],
            Path::new("/tmp/source.dump"),
        );
        assert!(!inv.has_arg("--schema-only"));
        assert!(!inv.has_arg("--data-only"));
        assert!(inv.has_arg("-Fc"));
    }

    #[test]
    fn test_restore_archive_args() {
        let inv = restore_archive(
            &PathBuf::from("pg_restore"),
            &profile("staging"),
            Path::new("/tmp/source.dump"),
            4,
        );
        assert_eq!(inv.arg_value("-j"), Some("4"));
        assert!(inv.has_arg("--no-owner"));
        assert!(inv.has_arg("--no-privileges"));
        assert_eq!(inv.args.last().map(String::as_str), Some("/tmp/source.dump"));
        assert_eq!(
            inv.arg_value("-d"),
            Some("host=localhost port=5432 dbname=staging user=postgres")
        );
    }

    #[test]
    fn test_restore_plain_applies_settings_first() {
        let inv = restore_plain(Path::new("psql"), &profile("staging"), Path::new("/tmp/source.sql"));
        let settings = inv.args.iter().position(|a| a == "-c").unwrap();
        let script = inv.args.iter().position(|a| a == "-f").unwrap();
        assert!(settings < script);
        assert!(inv.args[settings + 1].contains("session_replication_role = replica"));
        assert_eq!(inv.arg_value("-v"), Some("ON_ERROR_STOP=1"));
    }

    #[test]
    fn test_clean_sql_structure_drops_schemas() {
        let sql = clean_sql(CloneType::Both, &[]);
        assert!(sql.contains("DROP SCHEMA %I CASCADE"));
        assert!(sql.contains("CREATE SCHEMA public;"));
        assert!(!sql.contains("TRUNCATE"));
    }

    #[test]
    fn test_clean_sql_data_truncates_with_cascade() {
        let sql = clean_sql(CloneType::Data, &[]);
        assert!(sql.contains("'TRUNCATE TABLE ' || targets || ' CASCADE'"));
        assert!(!sql.contains("NOT IN ('"));
    }

    #[test]
    fn test_clean_sql_data_skips_excluded_tables() {
        let sql = clean_sql(
            CloneType::Data,
            &[QualifiedName::new("public", "audit_log"), QualifiedName::new("app", "o'neil")],
        );
        assert!(sql.contains("NOT IN ('public.audit_log', 'app.o''neil')"));
        assert!(sql.contains("'TRUNCATE TABLE ' || targets || ''"));
        assert!(!sql.contains("CASCADE"));
    }
}
