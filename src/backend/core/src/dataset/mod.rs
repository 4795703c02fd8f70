//! Tabular datasets: frames, split partitioning and on-disk storage.

pub mod frame;
pub mod split;
pub mod storage;

pub use frame::{Cell, Column, Frame, FrameError};
pub use split::{split_indexes, SplitIndices, SplitName, Splits};
pub use storage::{load_dataset, read_metadata, save_dataset, write_metadata, DatasetMetadata};

/// The three partitions of a stored dataset.
pub type DatasetSplits = Splits<Frame>;

/// Row counts of each split inside a concatenated working table.
pub type SplitBoundaries = Splits<usize>;

impl DatasetSplits {
    /// Stack train, test and validation into one working table.
    pub fn concat(&self) -> Result<(Frame, SplitBoundaries), FrameError> {
        let boundaries = Splits {
            train: self.train.n_rows(),
            test: self.test.n_rows(),
            validation: self.validation.n_rows(),
        };
        let table = Frame::vstack(&[
            self.train.clone(),
            self.test.clone(),
            self.validation.clone(),
        ])?;
        Ok((table, boundaries))
    }

    /// Cut a working table back into splits using the recorded row counts.
    pub fn resplit(table: &Frame, boundaries: &SplitBoundaries) -> Result<Self, FrameError> {
        let train_end = boundaries.train;
        let test_end = train_end + boundaries.test;
        let end = test_end + boundaries.validation;
        if end != table.n_rows() {
            return Err(FrameError::RowOutOfRange {
                index: end,
                len: table.n_rows(),
            });
        }
        Ok(Splits {
            train: table.slice_rows(0, train_end)?,
            test: table.slice_rows(train_end, test_end)?,
            validation: table.slice_rows(test_end, end)?,
        })
    }

    /// Materialise splits from a full table and per-split row positions.
    pub fn from_indices(table: &Frame, indices: &SplitIndices) -> Result<Self, FrameError> {
        Ok(Splits {
            train: table.take_rows(&indices.train)?,
            test: table.take_rows(&indices.test)?,
            validation: table.take_rows(&indices.validation)?,
        })
    }

    /// Restrict every split to the named columns.
    pub fn select(&self, names: &[String]) -> Result<Self, FrameError> {
        Ok(Splits {
            train: self.train.select(names)?,
            test: self.test.select(names)?,
            validation: self.validation.select(names)?,
        })
    }

    pub fn total_rows(&self) -> usize {
        self.train.n_rows() + self.test.n_rows() + self.validation.n_rows()
    }
}
