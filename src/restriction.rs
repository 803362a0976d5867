use crate::db::ProfileSnapshot;

/// The platform component that actually blocks applications.
///
/// Both calls must be idempotent: activating an already-active profile or
/// deactivating when nothing is blocked is a no-op. Results are not
/// reported back; the coordinator treats the engine as fire-and-forget.
pub trait RestrictionEngine: Send + Sync {
    fn activate_restrictions(&self, snapshot: &ProfileSnapshot);
    fn deactivate_restrictions(&self);
}
