pub mod approval_store;
pub mod artifact_store;
pub mod audit_store;
pub mod escalation_store;
pub mod request_store;

pub use approval_store::ApprovalStore;
pub use artifact_store::ArtifactStore;
pub use audit_store::AuditStore;
pub use escalation_store::EscalationStore;
pub use request_store::RequestStore;
