//! Binds a mutating request to the user who owns the target row.

use crate::auth::Identity;
use crate::error::{Error, Result};
use crate::models::{Pet, User};

/// A row that belongs to exactly one user.
pub trait Owned {
    /// Name used in error messages, e.g. "Pet".
    const KIND: &'static str;

    fn owner_id(&self) -> i64;
}

impl Owned for Pet {
    const KIND: &'static str = "Pet";

    fn owner_id(&self) -> i64 {
        self.owner_id
    }
}

impl Owned for User {
    const KIND: &'static str = "User";

    fn owner_id(&self) -> i64 {
        self.id
    }
}

/// Missing resource is `NotFound`; a resource owned by someone else is
/// `Forbidden`. Must run before any write that touches `resource`.
pub fn authorize<T: Owned>(identity: Identity, resource: Option<T>) -> Result<T> {
    let resource = resource.ok_or_else(|| Error::not_found(format!("{} not found", T::KIND)))?;
    if resource.owner_id() != identity.user_id() {
        tracing::warn!(
            caller = identity.user_id(),
            kind = T::KIND,
            "ownership check failed"
        );
        return Err(Error::forbidden(format!(
            "{} does not belong to the current user",
            T::KIND
        )));
    }
    Ok(resource)
}

/// Guard for routes addressed by user id: only the caller's own id passes,
/// whether or not the other id exists.
pub fn authorize_self(identity: Identity, user_id: i64) -> Result<()> {
    if identity.user_id() == user_id {
        Ok(())
    } else {
        Err(Error::forbidden("Cannot access another user's account"))
    }
}
