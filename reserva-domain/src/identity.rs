use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant-scoped caller identity carried by every synchronous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

impl Actor {
    pub fn new(user_id: Uuid, tenant_id: Uuid) -> Self {
        Self { user_id, tenant_id }
    }
}
