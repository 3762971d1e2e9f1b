//! Template lifecycle for kpve
//!
//! A `ProxmoxTemplate` class describes a cloud image and the template VM
//! built from it. [`TemplateManager`] downloads the image and creates one
//! template VM per target zone, keeps their mutable configuration in line
//! with the class, and removes both again. [`TemplateInventory`] is the
//! periodically rebuilt view of every template VM in every region, which the
//! instance orchestrator reads to find clone sources.

#![deny(missing_docs)]

pub mod image;
pub mod inventory;
pub mod manager;
pub mod skeleton;

#[cfg(test)]
mod test_support;

pub use image::{image_file_name, resolve_storage_roles, StorageRoles};
pub use inventory::{InstanceTemplateInfo, TemplateFilter, TemplateInventory, TemplateStatus};
pub use manager::TemplateManager;
