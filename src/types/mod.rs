/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across the components of the aggregator.
//!
//! Types specific to the aggregation protocol itself, e.g., [`Aggregate`](crate::handel::types::Aggregate),
//! live in [`crate::handel::types`].

pub mod bitmask;

pub mod crypto_primitives;

pub mod data_types;

pub mod replica_set;
