use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error};
use diesel::SqliteConnection;

use crate::db::{self, NewUser, User, UserChanges};

/// An identity as vouched for by the external provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalIdentity {
    pub external_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Resolve the local user for an external identity, creating it on first
/// login. For a known user, profile fields the provider reports with a new
/// value are written back; missing or identical ones are left alone. At most
/// one write happens per call.
///
/// The new user is a superuser iff its external id is `bootstrap_superuser`.
///
/// The write lock is taken up front so two first logins for the same identity
/// queue up instead of both inserting. A unique violation can still come from
/// a writer outside that lock; the lookup is then done again.
pub fn find_or_link(
    conn: &mut SqliteConnection,
    identity: &ExternalIdentity,
    bootstrap_superuser: Option<&str>,
) -> QueryResult<User> {
    match conn.immediate_transaction(|conn| link(conn, identity, bootstrap_superuser)) {
        Err(Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            log::info!(
                "external identity {} was linked concurrently, looking it up again",
                identity.external_id
            );
            conn.immediate_transaction(|conn| link(conn, identity, bootstrap_superuser))
        }
        res => res,
    }
}

fn link(
    conn: &mut SqliteConnection,
    identity: &ExternalIdentity,
    bootstrap_superuser: Option<&str>,
) -> QueryResult<User> {
    let email = non_empty(&identity.email);
    let first_name = non_empty(&identity.first_name);
    let last_name = non_empty(&identity.last_name);

    let user = match db::get_user_by_external_id(conn, &identity.external_id)? {
        Some(user) => user,
        None => {
            let is_superuser = bootstrap_superuser == Some(identity.external_id.as_str());
            log::info!(
                "creating user for external identity {} (superuser: {})",
                identity.external_id,
                is_superuser
            );
            return db::create_user(
                conn,
                &NewUser {
                    external_id: &identity.external_id,
                    email,
                    first_name,
                    last_name,
                    is_superuser,
                },
            );
        }
    };

    let changes = UserChanges {
        email: changed(email, &user.email),
        first_name: changed(first_name, &user.first_name),
        last_name: changed(last_name, &user.last_name),
        ..Default::default()
    };
    if changes.is_empty() {
        return Ok(user);
    }

    log::debug!("syncing profile of user {}: {:?}", user.id, changes);
    db::update_user(conn, user.id, &changes)?.ok_or(Error::NotFound)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn changed(incoming: Option<&str>, current: &Option<String>) -> Option<String> {
    match incoming {
        Some(v) if current.as_deref() != Some(v) => Some(v.to_string()),
        _ => None,
    }
}
