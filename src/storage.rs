//! Audio files on disk, one directory per owner under the upload root.
//!
//! A record exists iff its file is expected on disk. Uploads write the file
//! first and only then insert the record; deletes remove the file first and
//! only then the record. The one gap: if the insert fails after the file was
//! written, the file stays on disk with nothing pointing at it. See
//! [`crate::cleanup`] for the sweep that collects those.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rocket::tokio::fs;
use rocket::tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::db::{self, AudioFile, AudioFileChanges, NewAudioFile, Runner, User};
use crate::errors::{Result, SonoError};

pub const ALLOWED_CONTENT_TYPES: [&str; 5] = [
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "audio/aac",
    "audio/flac",
];

const CHUNK_SIZE: usize = 1024 * 1024;
const MAX_BASE_LEN: usize = 100;

/// Split off the extension (with its dot) the way most path libraries do:
/// the last dot of the last path component, unless everything before it in
/// that component is dots too.
fn split_extension(name: &str) -> (&str, &str) {
    let component_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name.rfind('.') {
        Some(dot) if dot > component_start => {
            if name[component_start..dot].chars().all(|c| c == '.') {
                (name, "")
            } else {
                name.split_at(dot)
            }
        }
        _ => (name, ""),
    }
}

/// Display name safe for storage: every character of the base outside
/// `[A-Za-z0-9_-]` becomes `_`, the base is cut to 100 characters, and the
/// extension is put back untouched.
pub fn sanitize_name(name: &str) -> String {
    let (base, ext) = split_extension(name);
    let safe_base: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_BASE_LEN)
        .collect();
    format!("{safe_base}{ext}")
}

/// Extension reused for the on-disk name, only when it can't surprise a
/// filesystem.
fn disk_extension(name: &str) -> &str {
    let (_, ext) = split_extension(name);
    if ext.len() > 1 && ext[1..].chars().all(|c| c.is_ascii_alphanumeric()) {
        ext
    } else {
        ""
    }
}

/// `audio/MPEG; charset=x` → `audio/mpeg`
fn media_type_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct Upload<'a> {
    pub owner_id: i32,
    pub content_type: &'a str,
    /// Name chosen by the uploader, wins over `stream_name`.
    pub provided_name: Option<&'a str>,
    /// Filename carried by the uploaded part itself.
    pub stream_name: Option<&'a str>,
}

enum CopyError {
    Read(std::io::Error),
    Write(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owner_dir(&self, owner_id: i32) -> PathBuf {
        self.root.join(owner_id.to_string())
    }

    pub fn full_path(&self, file: &AudioFile) -> PathBuf {
        self.root.join(&file.file_path)
    }

    pub async fn upload<D, R>(&self, db: &D, upload: Upload<'_>, reader: R) -> Result<AudioFile>
    where
        D: Runner,
        R: AsyncRead + Send,
    {
        let content_type = media_type_essence(upload.content_type);
        if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(SonoError::UnsupportedMediaType(format!(
                "{}, allowed types: {}",
                upload.content_type,
                ALLOWED_CONTENT_TYPES.join(", ")
            )));
        }

        let display_name = upload
            .provided_name
            .filter(|n| !n.is_empty())
            .or(upload.stream_name.filter(|n| !n.is_empty()))
            .ok_or_else(|| {
                SonoError::BadRequest(
                    "File name must be provided either via form or filename.".to_string(),
                )
            })?;
        let original_filename = sanitize_name(display_name);

        let ext = upload
            .stream_name
            .map(disk_extension)
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| disk_extension(display_name));
        let stored_filename = format!("{}{}", Uuid::new_v4(), ext);
        let file_path = format!("{}/{}", upload.owner_id, stored_filename);

        let owner_dir = self.owner_dir(upload.owner_id);
        fs::create_dir_all(&owner_dir).await.map_err(|err| {
            log::error!("cannot create {}: {err}", owner_dir.to_string_lossy());
            SonoError::Storage(err)
        })?;

        let dest = self.root.join(&file_path);
        log::info!(
            "going to write {} for user {} to {}",
            original_filename,
            upload.owner_id,
            dest.to_string_lossy()
        );
        let written = match write_stream(&dest, reader).await {
            Ok(n) => n,
            Err(err) => {
                if let Err(rm_err) = fs::remove_file(&dest).await {
                    if rm_err.kind() != ErrorKind::NotFound {
                        log::error!(
                            "could not remove partial upload {}: {rm_err}",
                            dest.to_string_lossy()
                        );
                    }
                }
                return Err(match err {
                    CopyError::Read(err) => {
                        log::info!("upload stream for {} broke: {err}", dest.to_string_lossy());
                        SonoError::BadRequest(format!("Could not read upload: {err}"))
                    }
                    CopyError::Write(err) => {
                        log::error!("error writing to file {}: {err}", dest.to_string_lossy());
                        SonoError::Storage(err)
                    }
                });
            }
        };
        log::info!("wrote {} bytes to {}", written, dest.to_string_lossy());

        let owner_id = upload.owner_id;
        let content_type = content_type.to_string();
        let record_path = file_path.clone();
        let created = db
            .run(move |c| {
                db::create_audio_file(
                    c,
                    &NewAudioFile {
                        original_filename: &original_filename,
                        stored_filename: &stored_filename,
                        content_type: &content_type,
                        file_path: &record_path,
                        user_id: owner_id,
                    },
                )
            })
            .await;
        match created {
            Ok(file) => Ok(file),
            Err(err) => {
                // known gap: the bytes stay on disk until a sweep
                log::error!("file {file_path} written but its record could not be created: {err}");
                Err(err.into())
            }
        }
    }

    /// Owner's files in upload order.
    pub async fn list<D: Runner>(
        &self,
        db: &D,
        owner_id: i32,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<AudioFile>> {
        Ok(db
            .run(move |c| db::get_audio_files_by_owner(c, owner_id, skip, limit))
            .await?)
    }

    /// Metadata of a file owned by `requester`.
    pub async fn get<D: Runner>(&self, db: &D, requester: &User, audio_id: i32) -> Result<AudioFile> {
        let file = db
            .run(move |c| db::get_audio_file(c, audio_id))
            .await?
            .ok_or(SonoError::NotFound("Audio file"))?;
        if file.user_id != requester.id {
            return Err(SonoError::Forbidden(
                "Not authorized to access this file".to_string(),
            ));
        }
        Ok(file)
    }

    /// Record and an open handle on its bytes.
    pub async fn open<D: Runner>(
        &self,
        db: &D,
        requester: &User,
        audio_id: i32,
    ) -> Result<(AudioFile, fs::File)> {
        let file = self.get(db, requester, audio_id).await?;
        let path = self.full_path(&file);
        match fs::File::open(&path).await {
            Ok(handle) => Ok((file, handle)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::error!("record {} points at missing {}", file.id, path.to_string_lossy());
                Err(SonoError::NotFound("Audio file content"))
            }
            Err(err) => Err(SonoError::Storage(err)),
        }
    }

    /// Change the display name. The stored file is untouched.
    pub async fn rename<D: Runner>(
        &self,
        db: &D,
        requester: &User,
        audio_id: i32,
        new_name: &str,
    ) -> Result<AudioFile> {
        self.get(db, requester, audio_id).await?;
        if new_name.is_empty() {
            return Err(SonoError::BadRequest("File name cannot be empty".to_string()));
        }
        let changes = AudioFileChanges {
            original_filename: Some(sanitize_name(new_name)),
        };
        db.run(move |c| db::update_audio_file(c, audio_id, &changes))
            .await?
            .ok_or(SonoError::NotFound("Audio file"))
    }

    /// Remove the file then its record. The owner or a superuser may do it.
    /// When the file exists but can't be removed the record is kept, so the
    /// owner can try again.
    pub async fn delete<D: Runner>(
        &self,
        db: &D,
        requester_id: i32,
        requester_is_superuser: bool,
        audio_id: i32,
    ) -> Result<()> {
        let file = db
            .run(move |c| db::get_audio_file(c, audio_id))
            .await?
            .ok_or(SonoError::NotFound("Audio file"))?;
        if file.user_id != requester_id && !requester_is_superuser {
            return Err(SonoError::Forbidden(
                "Not authorized to delete this file".to_string(),
            ));
        }

        let path = self.full_path(&file);
        log::info!("Removing file at {} with id {}", path.to_string_lossy(), file.id);
        match fs::remove_file(&path).await {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::NotFound => log::error!(
                "Attempted to delete file at {} but didn't find anything.",
                path.to_string_lossy()
            ),
            Err(err) => {
                log::error!("Could not remove file {}: {err:?}", path.to_string_lossy());
                return Err(SonoError::Storage(err));
            }
        }

        // a concurrent delete may have won the race
        db.run(move |c| db::delete_audio_file(c, audio_id))
            .await?
            .ok_or(SonoError::NotFound("Audio file"))?;
        Ok(())
    }

    /// Remove everything stored for an owner. A missing directory is fine.
    pub async fn remove_owner_dir(&self, owner_id: i32) -> Result<()> {
        let dir = self.owner_dir(owner_id);
        log::info!("remove_dir_all for {}", dir.to_string_lossy());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                log::error!("Could not remove {}: {err:?}", dir.to_string_lossy());
                Err(SonoError::Storage(err))
            }
        }
    }
}

/// Copy `reader` to a new file at `dest` one chunk at a time.
async fn write_stream<R: AsyncRead>(dest: &Path, reader: R) -> std::result::Result<u64, CopyError> {
    let mut reader = std::pin::pin!(reader);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .map_err(CopyError::Write)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(CopyError::Read)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await.map_err(CopyError::Write)?;
        written += n as u64;
    }
    file.flush().await.map_err(CopyError::Write)?;
    file.sync_all().await.map_err(CopyError::Write)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use rocket::tokio::io::ReadBuf;

    use super::*;
    use crate::db::{NewUser, SingleConnection};

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_name("my song!!.mp3"), "my_song__.mp3");
        assert_eq!(sanitize_name("demo.flac"), "demo.flac");
        assert_eq!(sanitize_name("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_name("chanson d'été.ogg"), "chanson_d__t_.ogg");
        assert_eq!(sanitize_name("no_extension"), "no_extension");
        assert_eq!(sanitize_name(".hidden"), "_hidden");
        assert_eq!(sanitize_name("archive.tar.gz"), "archive_tar.gz");
    }

    #[test]
    fn sanitize_truncates_long_bases() {
        let base = "a".repeat(101);
        let sanitized = sanitize_name(&format!("{base}.wav"));
        assert_eq!(sanitized, format!("{}.wav", "a".repeat(100)));
    }

    #[test]
    fn disk_extension_is_conservative() {
        assert_eq!(disk_extension("track.mp3"), ".mp3");
        assert_eq!(disk_extension("track"), "");
        assert_eq!(disk_extension("track."), "");
        assert_eq!(disk_extension("track.m p3"), "");
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        assert_eq!(media_type_essence("Audio/MPEG; rate=44100"), "audio/mpeg");
    }

    /// Yields `before` bytes then fails.
    struct BrokenReader {
        before: usize,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.before == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "client went away",
                )));
            }
            let n = self.before.min(buf.remaining());
            buf.put_slice(&vec![7u8; n]);
            self.before -= n;
            Poll::Ready(Ok(()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: FileStore,
        db: SingleConnection,
        owner: User,
        other: User,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("uploads"));
        let db = SingleConnection::in_memory().unwrap();
        let owner = make_user(&db, "yx-owner", false).await;
        let other = make_user(&db, "yx-other", false).await;
        Fixture {
            _dir: dir,
            store,
            db,
            owner,
            other,
        }
    }

    async fn make_user(db: &SingleConnection, external_id: &'static str, is_superuser: bool) -> User {
        db.run(move |c| {
            db::create_user(
                c,
                &NewUser {
                    external_id,
                    email: None,
                    first_name: None,
                    last_name: None,
                    is_superuser,
                },
            )
        })
        .await
        .unwrap()
    }

    fn upload<'a>(owner_id: i32, content_type: &'a str, name: &'a str) -> Upload<'a> {
        Upload {
            owner_id,
            content_type,
            provided_name: None,
            stream_name: Some(name),
        }
    }

    fn files_in(dir: &Path) -> usize {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[rocket::async_test]
    async fn upload_list_delete_round() {
        let f = fixture().await;
        let payload = b"fLaC not really".to_vec();

        let file = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/flac", "demo.flac"), &payload[..])
            .await
            .unwrap();
        assert_eq!(file.original_filename, "demo.flac");
        assert_eq!(file.content_type, "audio/flac");
        assert_eq!(file.user_id, f.owner.id);
        let (dir, stored) = file.file_path.split_once('/').unwrap();
        assert_eq!(dir, f.owner.id.to_string());
        assert_eq!(stored, file.stored_filename);
        let uuid_part = stored.strip_suffix(".flac").unwrap();
        assert!(Uuid::parse_str(uuid_part).is_ok());

        let on_disk = f.store.full_path(&file);
        assert_eq!(std::fs::read(&on_disk).unwrap(), payload);

        let listed = f.store.list(&f.db, f.owner.id, 0, 100).await.unwrap();
        assert_eq!(listed, vec![file.clone()]);

        f.store
            .delete(&f.db, f.owner.id, false, file.id)
            .await
            .unwrap();
        assert!(f.store.list(&f.db, f.owner.id, 0, 100).await.unwrap().is_empty());
        assert!(!on_disk.exists());
    }

    #[rocket::async_test]
    async fn unsupported_type_writes_nothing() {
        let f = fixture().await;
        let err = f
            .store
            .upload(&f.db, upload(f.owner.id, "text/plain", "notes.txt"), &b"hi"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, SonoError::UnsupportedMediaType(_)));
        assert!(f.store.list(&f.db, f.owner.id, 0, 100).await.unwrap().is_empty());
        assert_eq!(files_in(&f.store.owner_dir(f.owner.id)), 0);
    }

    #[rocket::async_test]
    async fn same_display_name_gets_distinct_storage() {
        let f = fixture().await;
        let first = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "track.mp3"), &b"one"[..])
            .await
            .unwrap();
        let second = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "track.mp3"), &b"two"[..])
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.stored_filename, second.stored_filename);
        assert_eq!(first.original_filename, second.original_filename);
        assert_eq!(std::fs::read(f.store.full_path(&first)).unwrap(), b"one");
        assert_eq!(std::fs::read(f.store.full_path(&second)).unwrap(), b"two");
        assert_eq!(f.store.list(&f.db, f.owner.id, 0, 100).await.unwrap().len(), 2);
    }

    #[rocket::async_test]
    async fn provided_name_wins() {
        let f = fixture().await;
        let file = f
            .store
            .upload(
                &f.db,
                Upload {
                    owner_id: f.owner.id,
                    content_type: "audio/ogg",
                    provided_name: Some("Morning take #2"),
                    stream_name: Some("rec-0001.ogg"),
                },
                &b"ogg"[..],
            )
            .await
            .unwrap();
        assert_eq!(file.original_filename, "Morning_take__2");
        assert!(file.stored_filename.ends_with(".ogg"));
    }

    #[rocket::async_test]
    async fn a_name_is_required() {
        let f = fixture().await;
        let nameless = Upload {
            owner_id: f.owner.id,
            content_type: "audio/wav",
            provided_name: Some(""),
            stream_name: None,
        };
        let err = f.store.upload(&f.db, nameless, &b"RIFF"[..]).await.unwrap_err();
        assert!(matches!(err, SonoError::BadRequest(_)));
        assert_eq!(files_in(&f.store.owner_dir(f.owner.id)), 0);
    }

    #[rocket::async_test]
    async fn broken_stream_leaves_nothing_behind() {
        let f = fixture().await;
        let err = f
            .store
            .upload(
                &f.db,
                upload(f.owner.id, "audio/aac", "cut.aac"),
                BrokenReader { before: 3000 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SonoError::BadRequest(_)));
        assert_eq!(files_in(&f.store.owner_dir(f.owner.id)), 0);
        assert!(f.store.list(&f.db, f.owner.id, 0, 100).await.unwrap().is_empty());
    }

    #[rocket::async_test]
    async fn unwritable_root_is_a_storage_error() {
        let f = fixture().await;
        // a plain file where the upload root should be
        std::fs::write(f.store.root(), b"in the way").unwrap();
        let err = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "a.mp3"), &b"x"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, SonoError::Storage(_)));
        assert!(f.store.list(&f.db, f.owner.id, 0, 100).await.unwrap().is_empty());
    }

    #[rocket::async_test]
    async fn strangers_cannot_touch_files() {
        let f = fixture().await;
        let file = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "mine.mp3"), &b"x"[..])
            .await
            .unwrap();

        let err = f
            .store
            .delete(&f.db, f.other.id, false, file.id)
            .await
            .unwrap_err();
        assert!(matches!(err, SonoError::Forbidden(_)));
        assert!(f.store.full_path(&file).exists());
        assert_eq!(f.store.list(&f.db, f.owner.id, 0, 100).await.unwrap().len(), 1);

        assert!(matches!(
            f.store.get(&f.db, &f.other, file.id).await,
            Err(SonoError::Forbidden(_))
        ));
        assert!(matches!(
            f.store.rename(&f.db, &f.other, file.id, "stolen.mp3").await,
            Err(SonoError::Forbidden(_))
        ));
    }

    #[rocket::async_test]
    async fn superuser_can_delete_any_file() {
        let f = fixture().await;
        let admin = make_user(&f.db, "yx-admin", true).await;
        let file = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "mine.mp3"), &b"x"[..])
            .await
            .unwrap();

        f.store
            .delete(&f.db, admin.id, admin.is_superuser, file.id)
            .await
            .unwrap();
        assert!(!f.store.full_path(&file).exists());
    }

    #[rocket::async_test]
    async fn deleting_unknown_file_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.store.delete(&f.db, f.owner.id, true, 999).await,
            Err(SonoError::NotFound(_))
        ));
    }

    #[rocket::async_test]
    async fn file_already_gone_still_drops_the_record() {
        let f = fixture().await;
        let file = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "gone.mp3"), &b"x"[..])
            .await
            .unwrap();
        std::fs::remove_file(f.store.full_path(&file)).unwrap();

        f.store.delete(&f.db, f.owner.id, false, file.id).await.unwrap();
        assert!(matches!(
            f.store.get(&f.db, &f.owner, file.id).await,
            Err(SonoError::NotFound(_))
        ));
    }

    #[rocket::async_test]
    async fn undeletable_file_keeps_its_record() {
        let f = fixture().await;
        let file = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "stuck.mp3"), &b"x"[..])
            .await
            .unwrap();
        // a non-empty directory can't be removed with remove_file
        let path = f.store.full_path(&file);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("inner"), b"x").unwrap();

        let err = f
            .store
            .delete(&f.db, f.owner.id, false, file.id)
            .await
            .unwrap_err();
        assert!(matches!(err, SonoError::Storage(_)));
        assert_eq!(f.store.get(&f.db, &f.owner, file.id).await.unwrap(), file);
    }

    #[rocket::async_test]
    async fn open_and_rename() {
        let f = fixture().await;
        let file = f
            .store
            .upload(&f.db, upload(f.owner.id, "audio/wav", "take.wav"), &b"RIFFdata"[..])
            .await
            .unwrap();

        let (record, mut handle) = f.store.open(&f.db, &f.owner, file.id).await.unwrap();
        let mut content = vec![];
        handle.read_to_end(&mut content).await.unwrap();
        assert_eq!(record, file);
        assert_eq!(content, b"RIFFdata");

        let renamed = f
            .store
            .rename(&f.db, &f.owner, file.id, "final take!.wav")
            .await
            .unwrap();
        assert_eq!(renamed.original_filename, "final_take_.wav");
        assert_eq!(renamed.file_path, file.file_path);
    }

    #[rocket::async_test]
    async fn remove_owner_dir_tolerates_absence() {
        let f = fixture().await;
        f.store.remove_owner_dir(f.other.id).await.unwrap();

        f.store
            .upload(&f.db, upload(f.owner.id, "audio/mpeg", "a.mp3"), &b"x"[..])
            .await
            .unwrap();
        f.store.remove_owner_dir(f.owner.id).await.unwrap();
        assert!(!f.store.owner_dir(f.owner.id).exists());
    }
}
