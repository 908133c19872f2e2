//! Quota callbacks supplied by whatever owns user accounts.

use async_trait::async_trait;

/// Consulted before every write and told about every successful write and
/// delete. The gateway never stores identity or usage itself.
#[async_trait]
pub trait QuotaHook: Send + Sync {
    async fn has_quota(&self, identity: &str, size: u64) -> bool;

    async fn charge(&self, _identity: &str, _size: u64) {}

    async fn credit(&self, _identity: &str, _size: u64) {}
}

/// Admits everything; the default when no accounting is wired in.
pub struct Unlimited;

#[async_trait]
impl QuotaHook for Unlimited {
    async fn has_quota(&self, _identity: &str, _size: u64) -> bool {
        true
    }
}
