//! Conversion between caller arrays with explicit missing entries and the
//! sentinel encoded arrays the engine works with.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use ndarray::{Array1, ArrayD, Axis, IxDyn, Zip};

use crate::engine::DataMap;

/// An array of values where some entries may be missing.
#[derive(Debug, Clone)]
pub struct MaskedArray {
    values: ArrayD<f64>,
    /// `true` marks a missing entry.
    mask: Option<ArrayD<bool>>,
}

/// Caller side data, keyed by variable name.
pub type DataSet = BTreeMap<String, MaskedArray>;

impl MaskedArray {
    /// An array without missing entries.
    pub fn new(values: ArrayD<f64>) -> Self {
        Self { values, mask: None }
    }

    /// An array where the entries flagged in `mask` are missing.
    pub fn masked(values: ArrayD<f64>, mask: ArrayD<bool>) -> Result<Self> {
        ensure!(
            values.shape() == mask.shape(),
            "Mask shape {:?} does not match value shape {:?}",
            mask.shape(),
            values.shape()
        );
        Ok(Self {
            values,
            mask: Some(mask),
        })
    }

    pub fn scalar(value: f64) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// A one dimensional array where `None` entries are missing.
    pub fn from_options(values: &[Option<f64>]) -> Self {
        let mask = ArrayD::from_shape_fn(IxDyn(&[values.len()]), |idx| values[idx[0]].is_none());
        let values = ArrayD::from_shape_fn(IxDyn(&[values.len()]), |idx| {
            values[idx[0]].unwrap_or(f64::NAN)
        });
        Self {
            values,
            mask: Some(mask),
        }
    }

    /// The underlying values. Missing entries hold unspecified values.
    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    pub fn mask(&self) -> Option<&ArrayD<bool>> {
        self.mask.as_ref()
    }

    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    pub fn is_masked(&self) -> bool {
        self.mask
            .as_ref()
            .is_some_and(|mask| mask.iter().any(|&missing| missing))
    }

    pub fn is_missing(&self, index: &[usize]) -> bool {
        self.mask
            .as_ref()
            .and_then(|mask| mask.get(IxDyn(index)).copied())
            .unwrap_or(false)
    }

    /// Entry at `index`, or `None` if it is missing or out of bounds.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if self.is_missing(index) {
            return None;
        }
        self.values.get(IxDyn(index)).copied()
    }
}

/// Two arrays are equal if they have the same shape, the same missing
/// entries and the same present values.
impl PartialEq for MaskedArray {
    fn eq(&self, other: &Self) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        let missing = |array: &MaskedArray, index: &IxDyn| {
            array.mask.as_ref().is_some_and(|mask| mask[index])
        };
        self.values
            .indexed_iter()
            .zip(other.values.iter())
            .all(|((index, left), right)| {
                let (left_missing, right_missing) = (missing(self, &index), missing(other, &index));
                left_missing == right_missing && (left_missing || left == right)
            })
    }
}

impl From<ArrayD<f64>> for MaskedArray {
    fn from(values: ArrayD<f64>) -> Self {
        Self::new(values)
    }
}

impl From<f64> for MaskedArray {
    fn from(value: f64) -> Self {
        Self::scalar(value)
    }
}

impl From<Vec<f64>> for MaskedArray {
    fn from(values: Vec<f64>) -> Self {
        Self::new(Array1::from(values).into_dyn())
    }
}

fn is_sentinel(value: f64, missing: f64) -> bool {
    value.to_bits() == missing.to_bits()
}

/// Encode caller data for the engine.
///
/// Arrays get at least one dimension, missing entries are replaced by
/// `missing` and empty arrays are dropped.
pub fn encode(data: &DataSet, missing: f64) -> DataMap {
    data.iter()
        .filter(|(_, array)| !array.values.is_empty())
        .map(|(name, array)| {
            let mut values = array.values.clone();
            let mut mask = array.mask.clone();
            if values.ndim() == 0 {
                values = values.insert_axis(Axis(0));
                mask = mask.map(|mask| mask.insert_axis(Axis(0)));
            }
            if let Some(mask) = mask {
                Zip::from(&mut values).and(&mask).for_each(|value, &is_missing| {
                    if is_missing {
                        *value = missing;
                    }
                });
            }
            (name.clone(), values)
        })
        .collect()
}

/// Decode one engine array, masking every entry equal to `missing`.
pub fn decode_array(values: ArrayD<f64>, missing: f64) -> MaskedArray {
    if !values.iter().any(|&value| is_sentinel(value, missing)) {
        return MaskedArray::new(values);
    }
    let mask = values.mapv(|value| is_sentinel(value, missing));
    let values = values.mapv(|value| {
        if is_sentinel(value, missing) {
            f64::NAN
        } else {
            value
        }
    });
    MaskedArray {
        values,
        mask: Some(mask),
    }
}

/// Decode engine data for the caller.
pub fn decode(data: DataMap, missing: f64) -> DataSet {
    data.into_iter()
        .map(|(name, values)| (name, decode_array(values, missing)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const NA: f64 = -f64::MAX * (1. - 1e-15);

    #[test]
    fn missing_entries_round_trip() -> Result<()> {
        let values = arr2(&[[1., 2., 3.], [4., 5., 6.]]).into_dyn();
        let mask = arr2(&[[false, true, false], [true, false, false]]).into_dyn();
        let mut data = DataSet::new();
        data.insert("y".to_string(), MaskedArray::masked(values, mask.clone())?);

        let encoded = encode(&data, NA);
        assert_eq!(encoded["y"][[0, 1]], NA);
        assert_eq!(encoded["y"][[1, 0]], NA);
        assert_eq!(encoded["y"][[1, 2]], 6.);

        let decoded = decode(encoded, NA);
        let y = &decoded["y"];
        assert_eq!(y.mask(), Some(&mask));
        assert_eq!(y.get(&[0, 0]), Some(1.));
        assert_eq!(y.get(&[0, 1]), None);
        assert_eq!(y.get(&[1, 2]), Some(6.));
        Ok(())
    }

    #[test]
    fn scalars_become_one_dimensional() {
        let mut data = DataSet::new();
        data.insert("n".to_string(), 10f64.into());
        let encoded = encode(&data, NA);
        assert_eq!(encoded["n"], arr1(&[10.]).into_dyn());
    }

    #[test]
    fn empty_arrays_are_dropped() {
        let mut data = DataSet::new();
        data.insert("x".to_string(), Vec::<f64>::new().into());
        data.insert("y".to_string(), vec![1.].into());
        let encoded = encode(&data, NA);
        assert_eq!(encoded.keys().collect::<Vec<_>>(), vec!["y"]);
    }

    #[test]
    fn extreme_values_are_not_masked() {
        let values = arr1(&[f64::MIN, f64::MAX, -f64::MAX * (1. - 1e-14), 0.]).into_dyn();
        let decoded = decode_array(values.clone(), NA);
        assert!(!decoded.is_masked());
        assert_eq!(decoded.values(), &values);
    }

    #[test]
    fn options_mark_missing_entries() {
        let data = MaskedArray::from_options(&[Some(0.), None, Some(1.)]);
        assert!(data.is_masked());
        assert!(data.is_missing(&[1]));
        assert_eq!(data.get(&[2]), Some(1.));

        let mut set = DataSet::new();
        set.insert("x".to_string(), data);
        let encoded = encode(&set, NA);
        assert_eq!(encoded["x"], arr1(&[0., NA, 1.]).into_dyn());
    }

    fn masked_arrays() -> impl Strategy<Value = MaskedArray> {
        proptest::collection::vec(1usize..5, 1..4).prop_flat_map(|shape| {
            let len = shape.iter().product::<usize>();
            (
                proptest::collection::vec(-1e300f64..1e300, len),
                proptest::collection::vec(any::<bool>(), len),
            )
                .prop_map(move |(values, mask)| {
                    let values = ArrayD::from_shape_vec(IxDyn(&shape), values).unwrap();
                    let mask = ArrayD::from_shape_vec(IxDyn(&shape), mask).unwrap();
                    MaskedArray::masked(values, mask).unwrap()
                })
        })
    }

    proptest! {
        #[test]
        fn masked_arrays_round_trip(array in masked_arrays()) {
            let mut data = DataSet::new();
            data.insert("x".to_string(), array.clone());
            let decoded = decode(encode(&data, NA), NA);
            prop_assert_eq!(&decoded["x"], &array);
        }
    }
}
