//! `UpgradeConfig` CRD type definition.

pub mod spec;
pub mod status;
pub mod types;

pub use spec::{UpgradeConfig, UpgradeConfigSpec};
pub use status::{UpgradeCondition, UpgradeConfigStatus, UpgradeHistory};
pub use types::{ConditionStatus, UpgradePhase, UpgradeType};
