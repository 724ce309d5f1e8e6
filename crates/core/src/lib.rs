//! `paysettle-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, calendar date ranges and money.

pub mod error;
pub mod id;
pub mod money;
pub mod period;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, MerchantId};
pub use money::Cents;
pub use period::DateRange;
pub use value_object::ValueObject;
