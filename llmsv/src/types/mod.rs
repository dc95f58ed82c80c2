//! 型定義

pub mod deployment;

pub use deployment::{
    display_name_of, DeploymentRecord, DeploymentSpec, DeploymentStatus, LaunchParams,
    ProcessDiagnostics, QuantizationDescriptor,
};
