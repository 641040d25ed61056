use async_trait::async_trait;

use crate::engine::EngineError;
use crate::model::{Room, RoomId, UserId};

/// Decides whether a user may act on a room, walking whatever ownership
/// chain the organization uses. Errors are passed through to the caller
/// unchanged.
#[async_trait]
pub trait AccessGate: Send + Sync {
    /// The room as the user is allowed to see it, or `NotFound`/`Forbidden`.
    async fn authorize(&self, room_id: RoomId, user_id: UserId) -> Result<Room, EngineError>;
}

/// User existence lookup for invitee validation.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Ids from `ids` that name no known user, in input order.
    async fn missing_users(&self, ids: &[UserId]) -> Vec<UserId>;
}
