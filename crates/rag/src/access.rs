use nestling_core::child::{ChildId, ChildProfile, UserId};
use nestling_core::error::Error;
use nestling_core::store::ChildDirectory;
use tracing::warn;

/// Load `child_id`'s profile and check that `user_id` is its guardian.
pub async fn authorize_child(
    directory: &dyn ChildDirectory,
    child_id: ChildId,
    user_id: UserId,
) -> Result<ChildProfile, Error> {
    let profile = directory
        .profile(child_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("child {child_id}")))?;
    if profile.guardian_id != user_id {
        warn!(child_id = %child_id, user_id = %user_id, "Rejected access to another guardian's child");
        return Err(Error::Unauthorized(format!(
            "child {child_id} does not belong to this user"
        )));
    }
    Ok(profile)
}
