//! Transaction id generation.

use uuid::Uuid;

/// Produces globally unique transaction ids.
///
/// Injected into the coordinator so deployments can swap in their own
/// scheme; the only requirement is collision-freedom across the cluster.
pub trait IdGenerator: Send + Sync {
    fn generate_id(&self) -> String;
}

/// Default generator backed by UUIDv7.
///
/// UUIDv7 is time-ordered at millisecond precision, which keeps TSR keys
/// roughly clustered by transaction age without any coordination.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate_id(&self) -> String {
        Uuid::now_v7().to_string()
    }
}
