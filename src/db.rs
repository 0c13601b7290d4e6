use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use chrono::NaiveDateTime;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde::{Deserialize, Serialize};

use crate::errors;
use crate::schema::{audio_files, users};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    pub id: i32,
    pub external_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub external_id: &'a str,
    pub email: Option<&'a str>,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub is_superuser: bool,
}

/// Partial update of a user. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, AsChangeset, Deserialize)]
#[diesel(table_name = users)]
pub struct UserChanges {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: Option<bool>,
    pub is_superuser: Option<bool>,
}

impl UserChanges {
    pub fn is_empty(&self) -> bool {
        self == &UserChanges::default()
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = audio_files)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AudioFile {
    pub id: i32,
    pub original_filename: String,
    pub stored_filename: String,
    pub content_type: String,
    pub file_path: String,
    pub user_id: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = audio_files)]
pub struct NewAudioFile<'a> {
    pub original_filename: &'a str,
    pub stored_filename: &'a str,
    pub content_type: &'a str,
    pub file_path: &'a str,
    pub user_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, AsChangeset)]
#[diesel(table_name = audio_files)]
pub struct AudioFileChanges {
    pub original_filename: Option<String>,
}

/// Runs blocking diesel work against a connection. Implemented by the
/// rocket pool guard in the web app and by [`SingleConnection`] elsewhere.
#[rocket::async_trait]
pub trait Runner: Send + Sync {
    async fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SqliteConnection) -> R + Send + 'static,
        R: Send + 'static;
}

/// One connection behind a mutex, for tests and command line tools.
pub struct SingleConnection(Mutex<SqliteConnection>);

impl SingleConnection {
    pub fn new(conn: SqliteConnection) -> Self {
        SingleConnection(Mutex::new(conn))
    }

    /// Fresh in-memory database with every migration applied.
    pub fn in_memory() -> errors::Result<Self> {
        let mut conn = connect(":memory:")?;
        run_migrations(&mut conn)?;
        Ok(SingleConnection::new(conn))
    }
}

#[rocket::async_trait]
impl Runner for SingleConnection {
    async fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SqliteConnection) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut conn = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn)
    }
}

pub fn connect(database_url: &str) -> errors::Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("Cannot open database at {database_url}"))?;
    configure(&mut conn)?;
    Ok(conn)
}

/// Per connection settings. sqlite forgets them when the connection closes.
pub fn configure(conn: &mut SqliteConnection) -> QueryResult<()> {
    conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
}

pub fn run_migrations(conn: &mut SqliteConnection) -> errors::Result<()> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow::anyhow!("cannot run migrations: {err}"))?;
    log::info!("applied {} migration(s)", applied.len());
    Ok(())
}

pub fn get_user(conn: &mut SqliteConnection, user_id: i32) -> QueryResult<Option<User>> {
    users::table
        .find(user_id)
        .select(User::as_select())
        .first(conn)
        .optional()
}

pub fn get_users(conn: &mut SqliteConnection, skip: i64, limit: i64) -> QueryResult<Vec<User>> {
    users::table
        .order(users::id.asc())
        .offset(skip)
        .limit(limit)
        .select(User::as_select())
        .load(conn)
}

pub fn get_user_by_external_id(
    conn: &mut SqliteConnection,
    external_id: &str,
) -> QueryResult<Option<User>> {
    users::table
        .filter(users::external_id.eq(external_id))
        .select(User::as_select())
        .first(conn)
        .optional()
}

pub fn create_user(conn: &mut SqliteConnection, new_user: &NewUser) -> QueryResult<User> {
    conn.transaction(|conn| {
        diesel::insert_into(users::table)
            .values(new_user)
            .execute(conn)?;
        users::table
            .filter(users::external_id.eq(new_user.external_id))
            .select(User::as_select())
            .first(conn)
    })
}

/// Returns `None` when no user has this id.
pub fn update_user(
    conn: &mut SqliteConnection,
    user_id: i32,
    changes: &UserChanges,
) -> QueryResult<Option<User>> {
    conn.transaction(|conn| {
        if !changes.is_empty() {
            let n = diesel::update(users::table.find(user_id))
                .set(changes)
                .execute(conn)?;
            if n == 0 {
                return Ok(None);
            }
        }
        get_user(conn, user_id)
    })
}

/// Deletes the user along with its audio records and returns what was
/// deleted, or `None` when there was nothing to delete.
pub fn delete_user(conn: &mut SqliteConnection, user_id: i32) -> QueryResult<Option<User>> {
    conn.transaction(|conn| {
        let user = match get_user(conn, user_id)? {
            Some(u) => u,
            None => return Ok(None),
        };
        diesel::delete(audio_files::table.filter(audio_files::user_id.eq(user_id)))
            .execute(conn)?;
        diesel::delete(users::table.find(user_id)).execute(conn)?;
        Ok(Some(user))
    })
}

pub fn get_audio_file(conn: &mut SqliteConnection, audio_id: i32) -> QueryResult<Option<AudioFile>> {
    audio_files::table
        .find(audio_id)
        .select(AudioFile::as_select())
        .first(conn)
        .optional()
}

/// Files of one owner in insertion order.
pub fn get_audio_files_by_owner(
    conn: &mut SqliteConnection,
    owner_id: i32,
    skip: i64,
    limit: i64,
) -> QueryResult<Vec<AudioFile>> {
    audio_files::table
        .filter(audio_files::user_id.eq(owner_id))
        .order(audio_files::id.asc())
        .offset(skip)
        .limit(limit)
        .select(AudioFile::as_select())
        .load(conn)
}

pub fn create_audio_file(
    conn: &mut SqliteConnection,
    new_file: &NewAudioFile,
) -> QueryResult<AudioFile> {
    conn.transaction(|conn| {
        diesel::insert_into(audio_files::table)
            .values(new_file)
            .execute(conn)?;
        audio_files::table
            .filter(audio_files::stored_filename.eq(new_file.stored_filename))
            .select(AudioFile::as_select())
            .first(conn)
    })
}

pub fn update_audio_file(
    conn: &mut SqliteConnection,
    audio_id: i32,
    changes: &AudioFileChanges,
) -> QueryResult<Option<AudioFile>> {
    conn.transaction(|conn| {
        if changes != &AudioFileChanges::default() {
            let n = diesel::update(audio_files::table.find(audio_id))
                .set(changes)
                .execute(conn)?;
            if n == 0 {
                return Ok(None);
            }
        }
        get_audio_file(conn, audio_id)
    })
}

pub fn delete_audio_file(
    conn: &mut SqliteConnection,
    audio_id: i32,
) -> QueryResult<Option<AudioFile>> {
    conn.transaction(|conn| {
        let file = match get_audio_file(conn, audio_id)? {
            Some(f) => f,
            None => return Ok(None),
        };
        diesel::delete(audio_files::table.find(audio_id)).execute(conn)?;
        Ok(Some(file))
    })
}

/// Every relative path referenced by a record.
pub fn get_all_file_paths(conn: &mut SqliteConnection) -> QueryResult<Vec<String>> {
    audio_files::table.select(audio_files::file_path).load(conn)
}
