use std::{
    collections::HashSet,
    io::ErrorKind,
    path::Path,
    time::{Duration, SystemTime},
};

use diesel::SqliteConnection;

use crate::db;
use crate::errors::Result;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Relative paths of orphans, removed unless it was a dry run.
    pub orphans: Vec<String>,
    /// Orphan candidates left alone because they are younger than the
    /// minimum age, most likely uploads still in flight.
    pub too_recent: usize,
}

/// Look for files under `<root>/<owner>/` that no audio record points at and
/// remove those older than `min_age`. This is how bytes orphaned by a failed
/// record insert eventually go away; nothing calls it implicitly.
pub fn sweep_orphans(
    conn: &mut SqliteConnection,
    root_path: &Path,
    min_age: Duration,
    dry_run: bool,
) -> Result<SweepReport> {
    log::debug!("sweeping orphans under {}", root_path.to_string_lossy());
    let known: HashSet<String> = db::get_all_file_paths(conn)?.into_iter().collect();
    let now = SystemTime::now();
    let mut report = SweepReport::default();

    let owners = match std::fs::read_dir(root_path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            log::info!("nothing to sweep, {} doesn't exist", root_path.to_string_lossy());
            return Ok(report);
        }
        Err(err) => return Err(err.into()),
    };

    for owner in owners {
        let owner = owner?;
        if !owner.file_type()?.is_dir() {
            continue;
        }
        let owner_name = owner.file_name().to_string_lossy().into_owned();
        for entry in std::fs::read_dir(owner.path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let rel_path = format!("{}/{}", owner_name, entry.file_name().to_string_lossy());
            if known.contains(&rel_path) {
                continue;
            }

            let age = entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            if age < min_age {
                report.too_recent += 1;
                continue;
            }

            if dry_run {
                log::info!("would remove orphan {rel_path}");
            } else {
                log::info!("Removing orphan file at {rel_path}");
                match std::fs::remove_file(entry.path()) {
                    Ok(_) => (),
                    Err(err) if err.kind() == ErrorKind::NotFound => log::error!(
                        "Attempted to delete file at {} but didn't find anything.",
                        rel_path
                    ),
                    Err(err) => {
                        log::error!("Could not remove file {rel_path}: {err:?}");
                        return Err(err.into());
                    }
                }
            }
            report.orphans.push(rel_path);
        }
    }

    report.orphans.sort();
    log::info!(
        "found {} orphan(s), skipped {} recent file(s)",
        report.orphans.len(),
        report.too_recent
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewAudioFile, NewUser};

    fn setup() -> (tempfile::TempDir, SqliteConnection) {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = db::connect(":memory:").unwrap();
        db::run_migrations(&mut conn).unwrap();
        let user = db::create_user(
            &mut conn,
            &NewUser {
                external_id: "yx-1",
                email: None,
                first_name: None,
                last_name: None,
                is_superuser: false,
            },
        )
        .unwrap();

        let owner_dir = dir.path().join(user.id.to_string());
        std::fs::create_dir_all(&owner_dir).unwrap();
        std::fs::write(owner_dir.join("kept.mp3"), b"kept").unwrap();
        std::fs::write(owner_dir.join("orphan.mp3"), b"orphan").unwrap();
        db::create_audio_file(
            &mut conn,
            &NewAudioFile {
                original_filename: "kept.mp3",
                stored_filename: "kept.mp3",
                content_type: "audio/mpeg",
                file_path: &format!("{}/kept.mp3", user.id),
                user_id: user.id,
            },
        )
        .unwrap();
        (dir, conn)
    }

    #[test]
    fn removes_only_unreferenced_files() {
        let (dir, mut conn) = setup();
        let report = sweep_orphans(&mut conn, dir.path(), Duration::ZERO, false).unwrap();

        assert_eq!(report.orphans, vec!["1/orphan.mp3".to_string()]);
        assert!(dir.path().join("1/kept.mp3").exists());
        assert!(!dir.path().join("1/orphan.mp3").exists());
    }

    #[test]
    fn dry_run_keeps_everything() {
        let (dir, mut conn) = setup();
        let report = sweep_orphans(&mut conn, dir.path(), Duration::ZERO, true).unwrap();

        assert_eq!(report.orphans, vec!["1/orphan.mp3".to_string()]);
        assert!(dir.path().join("1/orphan.mp3").exists());
    }

    #[test]
    fn recent_files_are_left_alone() {
        let (dir, mut conn) = setup();
        let report =
            sweep_orphans(&mut conn, dir.path(), Duration::from_secs(3600), false).unwrap();

        assert!(report.orphans.is_empty());
        assert_eq!(report.too_recent, 1);
        assert!(dir.path().join("1/orphan.mp3").exists());
    }

    #[test]
    fn missing_root_is_not_an_error() {
        let (dir, mut conn) = setup();
        let report =
            sweep_orphans(&mut conn, &dir.path().join("nope"), Duration::ZERO, false).unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
