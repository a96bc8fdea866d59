//! Combiners for shared aggregates.
//!
//! A [`Combine`] folds one contribution into an accumulator in place. The
//! runtime calls it while holding the aggregate's lock, so implementations
//! should be short and must not block.
//!
//! Contributions arrive in an unspecified order. When a deterministic final
//! value is required the combiner must be order-insensitive in effect
//! (associative and commutative), which [`Sum`], [`Max`] and [`Min`] are.
//! [`Collect`] is not: it records arrival order.
//!
//! # Example
//!
//! ```
//! use conflux_core::combine::{Combine, Max};
//!
//! let mut highest = 0_i32;
//! Max.combine(&mut highest, 7);
//! Max.combine(&mut highest, 3);
//! assert_eq!(highest, 7);
//!
//! // Closures work too
//! let product = |acc: &mut i64, delta: i64| *acc *= delta;
//! let mut acc = 1;
//! product.combine(&mut acc, 6);
//! assert_eq!(acc, 6);
//! ```

use std::ops::AddAssign;

/// Fold a contribution of type `D` into an accumulator of type `A`.
pub trait Combine<A, D>: Send + Sync {
    /// Apply `delta` to `acc`
    fn combine(&self, acc: &mut A, delta: D);
}

impl<A, D, F> Combine<A, D> for F
where
    F: Fn(&mut A, D) + Send + Sync,
{
    fn combine(&self, acc: &mut A, delta: D) {
        self(acc, delta);
    }
}

/// Adds each contribution to the accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sum;

impl<A, D> Combine<A, D> for Sum
where
    A: AddAssign<D>,
{
    fn combine(&self, acc: &mut A, delta: D) {
        *acc += delta;
    }
}

/// Keeps the largest value seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Max;

impl<A> Combine<A, A> for Max
where
    A: Ord,
{
    fn combine(&self, acc: &mut A, delta: A) {
        if delta > *acc {
            *acc = delta;
        }
    }
}

/// Keeps the smallest value seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Min;

impl<A> Combine<A, A> for Min
where
    A: Ord,
{
    fn combine(&self, acc: &mut A, delta: A) {
        if delta < *acc {
            *acc = delta;
        }
    }
}

/// Appends each contribution to a `Vec`, in arrival order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collect;

impl<T> Combine<Vec<T>, T> for Collect {
    fn combine(&self, acc: &mut Vec<T>, delta: T) {
        acc.push(delta);
    }
}
