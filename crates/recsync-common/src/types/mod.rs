//! Common types shared by the fetch, queue and storage stages

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single row pulled from the source API.
///
/// `id` is assigned by the source and is not guaranteed to be unique across
/// pages. Unknown fields in the source payload are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
}

impl Record {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
            phone: phone.into(),
        }
    }
}

/// An ordered group of records moved as one unit through fetch, queue and
/// storage.
///
/// Serializes as a plain JSON array, the same shape the source API returns,
/// so a page body can be decoded straight into a `Batch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch(Vec<Record>);

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self(records)
    }

    pub fn records(&self) -> &[Record] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize into the queue wire format.
    ///
    /// The whole batch is encoded in memory before anything is handed to the
    /// broker, so a batch is either published whole or not at all.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a queue payload produced by [`Batch::to_payload`].
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl From<Vec<Record>> for Batch {
    fn from(records: Vec<Record>) -> Self {
        Self(records)
    }
}

impl IntoIterator for Batch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Identifies one slice of the source's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    /// Split `total_rows` into pages of `batch_size`, rounding up so a
    /// trailing partial page is still requested.
    ///
    /// A zero `batch_size` yields no pages.
    pub fn partition(total_rows: u64, batch_size: u32) -> Vec<PageRequest> {
        if batch_size == 0 {
            return Vec::new();
        }
        let pages = total_rows.div_ceil(u64::from(batch_size));
        let pages = u32::try_from(pages).unwrap_or(u32::MAX);
        (0..pages)
            .map(|page| PageRequest::new(page, batch_size))
            .collect()
    }
}

impl std::fmt::Display for PageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page={}&size={}", self.page, self.size)
    }
}
