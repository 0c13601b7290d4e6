use std::sync::Arc;

use chrono::Utc;
use figment::Figment;
use futures::TryStreamExt;
use multer::{Constraints, Multipart, SizeLimit};
use rocket::data::{Data, ToByteUnit};
use rocket::fairing::{self, AdHoc};
use rocket::http::{ContentType, Status};
use rocket::outcome::{try_outcome, Outcome};
use rocket::request::{self, FromRequest};
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::tokio::fs;
use rocket::{Build, Rocket, State};
use rocket_sync_db_pools::database;
use serde::Deserialize;
use tokio_util::codec;
use tokio_util::io::StreamReader;

use crate::conf::SonoConfig;
use crate::db::{self, AudioFile, User, UserChanges};
use crate::errors::{self, Caught, GuardDetail, SonoError};
use crate::provider::{HttpProvider, IdentityProvider};
use crate::session::SessionIssuer;
use crate::storage::{FileStore, Upload};
use crate::token::TokenPair;
use crate::users::{self, ProfileUpdate};

const DEFAULT_PAGE_SIZE: i64 = 100;

#[database("sono")]
pub struct SonoDbConn(diesel::SqliteConnection);

#[rocket::async_trait]
impl db::Runner for SonoDbConn {
    async fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut diesel::SqliteConnection) -> R + Send + 'static,
        R: Send + 'static,
    {
        SonoDbConn::run(self, move |c| {
            if let Err(err) = db::configure(c) {
                log::error!("cannot configure pooled connection: {err}");
            }
            f(c)
        })
        .await
    }
}

/// Fail a guard, leaving the detail where the catcher will find it.
fn reject<T>(request: &rocket::Request<'_>, err: SonoError) -> request::Outcome<T, SonoError> {
    let status = err.status();
    let detail = err.detail();
    if status == Status::InternalServerError {
        log::error!("request guard failed: {:?}", err);
    }
    request.local_cache(|| GuardDetail(Some(detail)));
    Outcome::Error((status, err))
}

#[rocket::catch(default)]
fn default_catcher(status: Status, request: &rocket::Request<'_>) -> Caught {
    let detail = request
        .local_cache(GuardDetail::default)
        .0
        .clone()
        .unwrap_or_else(|| status.reason().unwrap_or("Unknown error").to_string());
    Caught { status, detail }
}

/// Raw token from `Authorization: Bearer <token>`.
pub struct BearerToken(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerToken {
    type Error = SonoError;

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        match request
            .headers()
            .get_one("Authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "))
        {
            Some(token) if !token.is_empty() => Outcome::Success(BearerToken(token.to_string())),
            _ => reject(request, SonoError::InvalidToken),
        }
    }
}

/// Holder of a valid access token.
pub struct CurrentUser(pub User);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CurrentUser {
    type Error = SonoError;

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        let token = try_outcome!(request.guard::<BearerToken>().await);
        let conn = match request.guard::<SonoDbConn>().await {
            Outcome::Success(conn) => conn,
            _ => {
                return reject(
                    request,
                    anyhow::anyhow!("Cannot access connection pool").into(),
                )
            }
        };
        let issuer = match request.rocket().state::<SessionIssuer>() {
            Some(issuer) => issuer,
            None => return reject(request, anyhow::anyhow!("no session issuer").into()),
        };

        match issuer.authenticate(&conn, &token.0, Utc::now()).await {
            Ok(user) => {
                log::debug!("authenticated user {}", user.id);
                Outcome::Success(CurrentUser(user))
            }
            Err(err) => reject(request, err),
        }
    }
}

pub struct ActiveUser(pub User);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ActiveUser {
    type Error = SonoError;

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        let CurrentUser(user) = try_outcome!(request.guard::<CurrentUser>().await);
        if !user.is_active {
            return reject(request, SonoError::BadRequest("Inactive user".to_string()));
        }
        Outcome::Success(ActiveUser(user))
    }
}

#[derive(Debug)]
struct MultipartBoundary(String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for MultipartBoundary {
    type Error = SonoError;

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        let boundary = request
            .content_type()
            .filter(|ct| ct.top() == "multipart" && ct.sub() == "form-data")
            .and_then(|ct| ct.param("boundary").map(|b| b.to_string()));
        match boundary {
            Some(boundary) => Outcome::Success(MultipartBoundary(boundary)),
            None => reject(
                request,
                SonoError::BadRequest("Expected a multipart/form-data body".to_string()),
            ),
        }
    }
}

fn page(skip: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    (
        skip.unwrap_or(0).max(0),
        limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(0, 1000),
    )
}

#[rocket::get("/auth/login")]
fn login(issuer: &State<SessionIssuer>) -> Redirect {
    Redirect::to(issuer.begin_login().to_string())
}

#[rocket::get("/auth/callback?<code>")]
async fn login_callback(
    code: &str,
    conn: SonoDbConn,
    issuer: &State<SessionIssuer>,
) -> errors::Result<Json<TokenPair>> {
    let pair = issuer.complete_login(&conn, code, Utc::now()).await?;
    Ok(Json(pair))
}

#[rocket::post("/auth/refresh-token")]
async fn refresh_token(
    token: BearerToken,
    conn: SonoDbConn,
    issuer: &State<SessionIssuer>,
) -> errors::Result<Json<TokenPair>> {
    let pair = issuer.refresh(&conn, &token.0, Utc::now()).await?;
    Ok(Json(pair))
}

#[rocket::get("/auth/test-auth")]
fn test_auth(user: ActiveUser) -> String {
    let user = user.0;
    format!(
        "Hello, authenticated user {}!",
        user.email.as_deref().unwrap_or(&user.external_id)
    )
}

#[rocket::get("/users/me")]
fn read_me(user: ActiveUser) -> Json<User> {
    Json(user.0)
}

#[rocket::put("/users/me", data = "<update>")]
async fn update_me(
    user: ActiveUser,
    conn: SonoDbConn,
    update: Json<ProfileUpdate>,
) -> errors::Result<Json<User>> {
    users::update_me(&conn, &user.0, update.into_inner())
        .await
        .map(Json)
}

#[rocket::get("/users?<skip>&<limit>")]
async fn list_users(
    user: ActiveUser,
    conn: SonoDbConn,
    skip: Option<i64>,
    limit: Option<i64>,
) -> errors::Result<Json<Vec<User>>> {
    let (skip, limit) = page(skip, limit);
    users::list(&conn, &user.0, skip, limit).await.map(Json)
}

#[rocket::get("/users/<user_id>")]
async fn read_user(user: ActiveUser, conn: SonoDbConn, user_id: i32) -> errors::Result<Json<User>> {
    users::get(&conn, &user.0, user_id).await.map(Json)
}

#[rocket::put("/users/<user_id>", data = "<changes>")]
async fn update_user(
    user: ActiveUser,
    conn: SonoDbConn,
    user_id: i32,
    changes: Json<UserChanges>,
) -> errors::Result<Json<User>> {
    users::update(&conn, &user.0, user_id, changes.into_inner())
        .await
        .map(Json)
}

#[rocket::delete("/users/<user_id>")]
async fn delete_user(
    user: ActiveUser,
    conn: SonoDbConn,
    store: &State<FileStore>,
    user_id: i32,
) -> errors::Result<Json<User>> {
    users::delete(&conn, store, &user.0, user_id).await.map(Json)
}

/// Multipart form with a `file` part and an optional `file_name` text part.
/// A `file_name` sent after the file is applied as a rename, so the explicit
/// name always ends up on the record. Empty names count as absent. Any error
/// after the file was stored removes it again along with its record.
#[rocket::post("/audio/upload", data = "<data>")]
async fn upload_audio(
    user: ActiveUser,
    conn: SonoDbConn,
    boundary: MultipartBoundary,
    data: Data<'_>,
    store: &State<FileStore>,
    config: &State<SonoConfig>,
) -> errors::Result<(Status, Json<AudioFile>)> {
    let user = user.0;
    let max_file_size = config.max_upload_mib.mebibytes();
    // leave some room for the boundaries and the name field
    let max_stream_size = max_file_size + 64.kibibytes();
    log::info!("streaming at most {} for user {}", max_stream_size, user.id);

    let stream = codec::FramedRead::new(data.open(max_stream_size), codec::BytesCodec::new());
    let constraints = Constraints::new().size_limit(
        SizeLimit::new()
            .whole_stream(max_stream_size.as_u64())
            .for_field("file", max_file_size.as_u64()),
    );
    let mut multipart = Multipart::with_constraints(stream, boundary.0, constraints);

    let mut provided_name: Option<String> = None;
    let mut created: Option<AudioFile> = None;
    let read_fields = async {
        while let Some(field) = multipart.next_field().await? {
            match field.name() {
                Some("file_name") => {
                    let name = field.text().await?;
                    if name.is_empty() {
                        continue;
                    }
                    match created.as_ref().map(|f| f.id) {
                        Some(audio_id) => {
                            created = Some(store.rename(&conn, &user, audio_id, &name).await?);
                        }
                        None => provided_name = Some(name),
                    }
                }
                Some("file") if created.is_none() => {
                    let content_type = field
                        .content_type()
                        .map(|ct| ct.to_string())
                        .unwrap_or_default();
                    let stream_name = field.file_name().map(|n| n.to_string());
                    let reader = StreamReader::new(
                        field.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)),
                    );
                    let upload = Upload {
                        owner_id: user.id,
                        content_type: &content_type,
                        provided_name: provided_name.as_deref(),
                        stream_name: stream_name.as_deref(),
                    };
                    created = Some(store.upload(&conn, upload, reader).await?);
                }
                other => log::debug!("ignoring multipart field {:?}", other),
            }
        }
        Ok::<_, SonoError>(())
    };
    let outcome = read_fields.await;

    match (outcome, created) {
        (Ok(()), Some(file)) => {
            log::info!("user {} uploaded {} as {}", user.id, file.original_filename, file.file_path);
            Ok((Status::Created, Json(file)))
        }
        (Ok(()), None) => Err(SonoError::BadRequest("Missing file field".to_string())),
        (Err(err), Some(file)) => {
            log::info!("rolling back upload {} after: {}", file.id, err);
            if let Err(rollback_err) = store
                .delete(&conn, user.id, user.is_superuser, file.id)
                .await
            {
                log::error!("could not roll back upload {}: {:?}", file.id, rollback_err);
            }
            Err(err)
        }
        (Err(err), None) => Err(err),
    }
}

#[rocket::get("/audio?<skip>&<limit>")]
async fn list_audio(
    user: ActiveUser,
    conn: SonoDbConn,
    store: &State<FileStore>,
    skip: Option<i64>,
    limit: Option<i64>,
) -> errors::Result<Json<Vec<AudioFile>>> {
    let (skip, limit) = page(skip, limit);
    store.list(&conn, user.0.id, skip, limit).await.map(Json)
}

#[rocket::get("/audio/<audio_id>")]
async fn read_audio(
    user: ActiveUser,
    conn: SonoDbConn,
    store: &State<FileStore>,
    audio_id: i32,
) -> errors::Result<Json<AudioFile>> {
    store.get(&conn, &user.0, audio_id).await.map(Json)
}

#[rocket::get("/audio/<audio_id>/content")]
async fn download_audio(
    user: ActiveUser,
    conn: SonoDbConn,
    store: &State<FileStore>,
    audio_id: i32,
) -> errors::Result<(ContentType, fs::File)> {
    let (file, fd) = store.open(&conn, &user.0, audio_id).await?;
    let content_type = ContentType::parse_flexible(&file.content_type).unwrap_or(ContentType::Binary);
    Ok((content_type, fd))
}

#[derive(Debug, Deserialize)]
struct AudioRename {
    original_filename: String,
}

#[rocket::put("/audio/<audio_id>", data = "<rename>")]
async fn rename_audio(
    user: ActiveUser,
    conn: SonoDbConn,
    store: &State<FileStore>,
    audio_id: i32,
    rename: Json<AudioRename>,
) -> errors::Result<Json<AudioFile>> {
    store
        .rename(&conn, &user.0, audio_id, &rename.original_filename)
        .await
        .map(Json)
}

#[rocket::delete("/audio/<audio_id>")]
async fn delete_audio(
    user: ActiveUser,
    conn: SonoDbConn,
    store: &State<FileStore>,
    audio_id: i32,
) -> errors::Result<Status> {
    let user = user.0;
    store
        .delete(&conn, user.id, user.is_superuser, audio_id)
        .await?;
    Ok(Status::NoContent)
}

async fn run_migrations(rocket: Rocket<Build>) -> fairing::Result {
    let conn = match SonoDbConn::get_one(&rocket).await {
        Some(conn) => conn,
        None => {
            log::error!("Cannot access connection pool");
            return Err(rocket);
        }
    };
    match conn.run(|c| db::run_migrations(c)).await {
        Ok(()) => Ok(rocket),
        Err(err) => {
            log::error!("database migrations failed: {:?}", err);
            Err(rocket)
        }
    }
}

/// The app as configured by `figment`, talking to the HTTP identity provider
/// described there.
pub fn build_app(figment: Figment) -> errors::Result<Rocket<Build>> {
    let config = SonoConfig::from_figment(&figment)
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    let provider = HttpProvider::new(&config.provider)?;
    build_app_with_provider(figment, Arc::new(provider))
}

pub fn build_app_with_provider(
    figment: Figment,
    provider: Arc<dyn IdentityProvider>,
) -> errors::Result<Rocket<Build>> {
    let config = SonoConfig::from_figment(&figment)
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    let issuer = SessionIssuer::new(&config, provider)?;
    let store = FileStore::new(config.upload_root.clone());
    log::info!("storing uploads under {}", store.root().to_string_lossy());

    Ok(rocket::custom(figment)
        .mount(
            "/api/v1",
            rocket::routes![
                login,
                login_callback,
                refresh_token,
                test_auth,
                read_me,
                update_me,
                list_users,
                read_user,
                update_user,
                delete_user,
                upload_audio,
                list_audio,
                read_audio,
                download_audio,
                rename_audio,
                delete_audio,
            ],
        )
        .register("/", rocket::catchers![default_catcher])
        .attach(SonoDbConn::fairing())
        .attach(AdHoc::try_on_ignite("Database migrations", run_migrations))
        .manage(config)
        .manage(issuer)
        .manage(store))
}
