use serde::Deserialize;

use crate::db::{self, Runner, User, UserChanges};
use crate::errors::{Result, SonoError};
use crate::storage::FileStore;

/// What a user may change about themselves.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

fn check_email(email: &Option<String>) -> Result<()> {
    match email {
        Some(email) => match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(SonoError::BadRequest(format!("{email} is not a valid email"))),
        },
        None => Ok(()),
    }
}

fn require_superuser(requester: &User) -> Result<()> {
    if requester.is_superuser {
        Ok(())
    } else {
        Err(SonoError::Forbidden(
            "The user doesn't have enough privileges".to_string(),
        ))
    }
}

pub async fn update_me<D: Runner>(db: &D, me: &User, update: ProfileUpdate) -> Result<User> {
    let changes = UserChanges {
        email: update.email,
        first_name: update.first_name,
        last_name: update.last_name,
        ..Default::default()
    };
    if changes.is_empty() {
        return Err(SonoError::BadRequest(
            "No update data provided or only restricted fields attempted.".to_string(),
        ));
    }
    check_email(&changes.email)?;

    let user_id = me.id;
    db.run(move |c| db::update_user(c, user_id, &changes))
        .await?
        .ok_or(SonoError::NotFound("User"))
}

pub async fn list<D: Runner>(db: &D, requester: &User, skip: i64, limit: i64) -> Result<Vec<User>> {
    require_superuser(requester)?;
    Ok(db.run(move |c| db::get_users(c, skip, limit)).await?)
}

pub async fn get<D: Runner>(db: &D, requester: &User, user_id: i32) -> Result<User> {
    require_superuser(requester)?;
    db.run(move |c| db::get_user(c, user_id))
        .await?
        .ok_or(SonoError::NotFound("User"))
}

pub async fn update<D: Runner>(
    db: &D,
    requester: &User,
    user_id: i32,
    changes: UserChanges,
) -> Result<User> {
    require_superuser(requester)?;
    check_email(&changes.email)?;
    db.run(move |c| db::update_user(c, user_id, &changes))
        .await?
        .ok_or(SonoError::NotFound("User"))
}

/// Delete a user with all of their files. Superusers can't be deleted this
/// way. The files go first: if they can't be removed the user is kept.
pub async fn delete<D: Runner>(
    db: &D,
    store: &FileStore,
    requester: &User,
    user_id: i32,
) -> Result<User> {
    require_superuser(requester)?;
    let target = db
        .run(move |c| db::get_user(c, user_id))
        .await?
        .ok_or(SonoError::NotFound("User"))?;
    if target.is_superuser {
        return Err(SonoError::Forbidden(
            "Superusers cannot be deleted this way".to_string(),
        ));
    }

    store.remove_owner_dir(target.id).await?;
    let deleted = db
        .run(move |c| db::delete_user(c, user_id))
        .await?
        .ok_or(SonoError::NotFound("User"))?;
    log::info!("deleted user {} ({})", deleted.id, deleted.external_id);
    Ok(deleted)
}
