//! Permission gate
//!
//! Static, deployment-wide write permissions. DDL has no flag and is always
//! refused; SELECT and OTHER always pass.

use super::error::GuardError;
use super::types::{PermissionSet, QueryCategory};

pub fn validate(category: QueryCategory, permissions: &PermissionSet) -> Result<(), GuardError> {
    let allowed = match category {
        QueryCategory::Select | QueryCategory::Other => true,
        QueryCategory::Insert => permissions.allow_insert,
        QueryCategory::Update => permissions.allow_update,
        QueryCategory::Delete => permissions.allow_delete,
        QueryCategory::Ddl => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(GuardError::PermissionDenied { category })
    }
}
