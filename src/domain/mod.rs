//! Domain layer: value objects, entities and the rules that govern them.
//!
//! Nothing in here performs I/O. Persistence goes through the traits in
//! [`ports`], implemented by the infrastructure layer.

pub mod asset;
pub mod credit;
pub mod discount;
pub mod money;
pub mod penalty;
pub mod ports;
pub mod reservation;
pub mod statement;
pub mod transaction;

/// Organization (association) reference, owned by the registry.
pub type OrgId = u32;
/// Unit (lot/condo) reference, owned by the registry.
pub type UnitId = u32;
/// Bookable asset reference.
pub type AssetId = u32;
/// Discount configuration reference.
pub type DiscountId = u32;
/// User reference for requesters, approvers and recorders.
pub type UserId = u32;
