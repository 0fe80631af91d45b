//! Ordered-collection abstraction the solvers are written against.
//!
//! The decomposition only ever touches its input rows through associative,
//! commutative aggregations plus element-wise `map`/`filter`, so any backend
//! honoring this trait (sequential, rayon, something distributed) yields the
//! same results. A sequential `Vec` backend and a rayon backend are provided.
use rayon::prelude::*;

pub trait DataSet<T: Clone + Send + Sync>: Sized {
    /// Fold every element into an accumulator (`seq_op`), combining partial
    /// accumulators with `comb_op`. Both operations must be associative and
    /// commutative for backend independence.
    fn aggregate<Z, S, C>(&self, zero: Z, seq_op: S, comb_op: C) -> Z
    where
        Z: Clone + Send + Sync,
        S: Fn(Z, &T) -> Z + Send + Sync,
        C: Fn(Z, Z) -> Z + Send + Sync;

    fn map<F>(&self, f: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync;

    fn filter<P>(&self, keep: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync;

    fn zip_with_index(&self) -> Vec<(T, usize)>;

    fn size(&self) -> usize;

    fn head(&self) -> Option<T>;

    fn to_vec(&self) -> Vec<T>;
}

/// The plain in-memory backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqDataSet<T> {
    items: Vec<T>,
}

impl<T> From<Vec<T>> for SeqDataSet<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T: Clone + Send + Sync> DataSet<T> for SeqDataSet<T> {
    fn aggregate<Z, S, C>(&self, zero: Z, seq_op: S, _comb_op: C) -> Z
    where
        Z: Clone + Send + Sync,
        S: Fn(Z, &T) -> Z + Send + Sync,
        C: Fn(Z, Z) -> Z + Send + Sync,
    {
        self.items.iter().fold(zero, |acc, it| seq_op(acc, it))
    }

    fn map<F>(&self, f: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync,
    {
        Self {
            items: self.items.iter().map(|it| f(it)).collect(),
        }
    }

    fn filter<P>(&self, keep: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync,
    {
        Self {
            items: self.items.iter().filter(|it| keep(it)).cloned().collect(),
        }
    }

    fn zip_with_index(&self) -> Vec<(T, usize)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, it)| (it.clone(), i))
            .collect()
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn head(&self) -> Option<T> {
        self.items.first().cloned()
    }

    fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

/// Rayon-backed backend. Aggregations are split across the thread pool and
/// merged with `comb_op`.
#[derive(Debug, Clone)]
pub struct ParDataSet<T> {
    items: Vec<T>,
}

impl<T> From<Vec<T>> for ParDataSet<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T: Clone + Send + Sync> DataSet<T> for ParDataSet<T> {
    fn aggregate<Z, S, C>(&self, zero: Z, seq_op: S, comb_op: C) -> Z
    where
        Z: Clone + Send + Sync,
        S: Fn(Z, &T) -> Z + Send + Sync,
        C: Fn(Z, Z) -> Z + Send + Sync,
    {
        self.items
            .par_iter()
            .fold(|| zero.clone(), |acc, it| seq_op(acc, it))
            .reduce(|| zero.clone(), |a, b| comb_op(a, b))
    }

    fn map<F>(&self, f: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync,
    {
        Self {
            items: self.items.par_iter().map(|it| f(it)).collect(),
        }
    }

    fn filter<P>(&self, keep: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync,
    {
        Self {
            items: self
                .items
                .par_iter()
                .filter(|it| keep(it))
                .cloned()
                .collect(),
        }
    }

    fn zip_with_index(&self) -> Vec<(T, usize)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, it)| (it.clone(), i))
            .collect()
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn head(&self) -> Option<T> {
        self.items.first().cloned()
    }

    fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}
