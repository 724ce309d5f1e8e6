//! Marker for types that are defined entirely by their value.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. In this domain
/// `Cents` and `DateRange` are value objects, while a settlement job is an
/// entity (it has an identity that survives status changes).
///
/// The trait requires `Clone + PartialEq + Debug` so value objects can be freely
/// copied into work items, compared in tests and logged.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
