// Tenant lifecycle: the registry cache over the control database and the
// per-tenant supervisor that owns pools, migrations, and the CDC replicator.
pub mod pools;
pub mod registry;
pub mod supervisor;

pub use pools::TenantPoolManager;
pub use registry::{ControlStore, Lookup, MemoryStore, RegistryConfig, TenantRegistry, TenantStore};
pub use supervisor::{SupervisorConfig, TenantNode, TenantPhase, TenantSupervisors};

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
pub type TenantResult<T> = std::result::Result<T, TenantError>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("control database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("bad tenant row: {0}")]
    Decode(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TenantError {
    #[error("tenant not found: {0}")]
    NotFound(String),
    #[error("tenant suspended: {0}")]
    Suspended(String),
    #[error("tenant {tenant} unavailable: {reason}")]
    Unavailable { tenant: String, reason: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
