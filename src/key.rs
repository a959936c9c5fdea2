// src/key.rs
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an opened dataset: the URI plus the processing options that
/// produce its derived view. Two keys are the same dataset iff both parts are
/// equal, option order included.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetKey {
    pub uri: String,
    pub options: Vec<String>,
}

impl DatasetKey {
    pub fn new<U, I, S>(uri: U, options: I) -> Self
    where
        U: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uri: uri.into(),
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Value following `flag` in the option list, e.g. `option_values("-ts", 2)`.
    pub fn option_values(&self, flag: &str, count: usize) -> Option<&[String]> {
        let pos = self.options.iter().position(|o| o == flag)?;
        self.options.get(pos + 1..pos + 1 + count)
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.options.is_empty() {
            write!(f, "{}", self.uri)
        } else {
            write!(f, "{} [{}]", self.uri, self.options.iter().join(" "))
        }
    }
}

/// Which view of an entry an operation addresses.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DatasetSelector {
    /// The dataset as stored.
    #[default]
    Source = 0,
    /// The warped view built from the key's options.
    Processed = 1,
}

impl DatasetSelector {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DatasetSelector::Source),
            1 => Some(DatasetSelector::Processed),
            _ => None,
        }
    }
}
