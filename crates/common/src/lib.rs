//! Shared wire types for the VPN fleet workspace.
//!
//! `peer` holds the contract spoken by every VPN node's management API,
//! `api` holds the operator-facing DTOs served by the control plane.

#![warn(missing_docs)]

/// Operator API DTOs.
pub mod api;
/// Remote node peer-management wire contract.
pub mod peer;
