//! API types for Portico gateway resources

pub mod v1alpha1;

pub use v1alpha1::{HTTPRoute, OIDCAuth};
