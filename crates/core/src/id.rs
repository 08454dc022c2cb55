//! Unique identifiers for runtime entities.
//!
//! Built on [`domain-key`](https://crates.io/crates/domain-key) `Uuid<D>`
//! wrappers, so an [`InstanceId`] can never be passed where a [`FiberId`]
//! is expected. All ids are `Copy`, hashable, and serialize as
//! UUID strings.

use domain_key::define_uuid;

pub use domain_key::UuidParseError;

define_uuid!(pub InstanceIdDomain => InstanceId);
define_uuid!(pub FiberIdDomain => FiberId);
define_uuid!(pub IncidentIdDomain => IncidentId);
