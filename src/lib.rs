#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod cardinality;

/// A keyed map wrapping the raw `HashTable`.
///
/// This module provides a `HashMap` that owns a hasher builder, a reducer,
/// and the resident cardinality estimator, exposing a standard key-value
/// interface over the hint-based table.
pub mod hash_map;

pub mod hash_table;

pub mod reduce;

pub use cardinality::CardinalityEstimator;
pub use hash_map::HashMap;
pub use hash_table::HashTable;
pub use reduce::DiscardReducer;
pub use reduce::Reducer;
pub use reduce::ReplaceReducer;

/// The default hasher builder used by [`HashMap`].
pub type DefaultHashBuilder = foldhash::fast::FixedState;
