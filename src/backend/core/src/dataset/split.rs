//! Train/test/validation partitioning.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three dataset partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitName {
    Train,
    Test,
    Validation,
}

impl SplitName {
    /// Storage and concatenation order.
    pub const ALL: [SplitName; 3] = [SplitName::Train, SplitName::Test, SplitName::Validation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for SplitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value per split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Splits<T> {
    pub train: T,
    pub test: T,
    pub validation: T,
}

impl<T> Splits<T> {
    pub fn get(&self, split: SplitName) -> &T {
        match split {
            SplitName::Train => &self.train,
            SplitName::Test => &self.test,
            SplitName::Validation => &self.validation,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(SplitName, T) -> U) -> Splits<U> {
        Splits {
            train: f(SplitName::Train, self.train),
            test: f(SplitName::Test, self.test),
            validation: f(SplitName::Validation, self.validation),
        }
    }

    /// Like [`Splits::map`] but short-circuits on the first error.
    pub fn try_map<U, E>(
        self,
        mut f: impl FnMut(SplitName, T) -> Result<U, E>,
    ) -> Result<Splits<U>, E> {
        Ok(Splits {
            train: f(SplitName::Train, self.train)?,
            test: f(SplitName::Test, self.test)?,
            validation: f(SplitName::Validation, self.validation)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (SplitName, &T)> {
        [
            (SplitName::Train, &self.train),
            (SplitName::Test, &self.test),
            (SplitName::Validation, &self.validation),
        ]
        .into_iter()
    }
}

/// Row positions per split.
pub type SplitIndices = Splits<Vec<usize>>;

/// Partition `[0, total_rows)` into train, test and validation indices.
///
/// Two stages: first `floor(train_size * n)` rows go to train, then the rest
/// is divided with test taking `test_size / (test_size + val_size)` of it.
/// Fractions are not checked to sum to one. Rows are shuffled with a
/// `StdRng` seeded from `seed` when given, from entropy otherwise.
pub fn split_indexes(
    total_rows: usize,
    train_size: f64,
    test_size: f64,
    val_size: f64,
    seed: Option<u64>,
) -> SplitIndices {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut indexes: Vec<usize> = (0..total_rows).collect();
    indexes.shuffle(&mut rng);
    let n_train = fraction_of(total_rows, train_size);
    let rest = indexes.split_off(n_train);
    let train = indexes;

    let test_val = test_size + val_size;
    let test_share = if test_val > 0.0 { test_size / test_val } else { 0.0 };
    let mut rest = rest;
    rest.shuffle(&mut rng);
    let n_test = fraction_of(rest.len(), test_share);
    let validation = rest.split_off(n_test);

    Splits {
        train,
        test: rest,
        validation,
    }
}

fn fraction_of(n: usize, fraction: f64) -> usize {
    let raw = (fraction.clamp(0.0, 1.0) * n as f64).floor() as usize;
    raw.min(n)
}
