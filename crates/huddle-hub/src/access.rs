//! Project membership lookup used when admitting a connection.

use async_trait::async_trait;
use huddle_common::error::HuddleResult;
use uuid::Uuid;

/// Resolves a user's role inside a project.
///
/// Membership is owned by the project service; the Hub only asks.
#[async_trait]
pub trait ProjectAccess: Send + Sync {
    /// `Ok(None)` means the user is not a member.
    async fn role(&self, project_id: Uuid, user_id: &str) -> HuddleResult<Option<String>>;
}

/// Admits every authenticated user as an editor.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAccess;

#[async_trait]
impl ProjectAccess for OpenAccess {
    async fn role(&self, _project_id: Uuid, _user_id: &str) -> HuddleResult<Option<String>> {
        Ok(Some("editor".to_owned()))
    }
}
