//! 予測配列
//!
//! 値は常に `f64` で保持し、読み込み時の精度は `Precision` で丸める。

use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

/// 読み込み時に適用する浮動小数点精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    Half,
    #[default]
    Single,
    Double,
}

impl Precision {
    /// ビット幅（16/32/64）から変換する
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            16 => Ok(Precision::Half),
            32 => Ok(Precision::Single),
            64 => Ok(Precision::Double),
            other => Err(EnsembleError::InvalidConfiguration(format!(
                "precision must be one of 16, 32, 64 (got {other})"
            ))),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Precision::Half => 16,
            Precision::Single => 32,
            Precision::Double => 64,
        }
    }

    #[inline]
    pub fn round(self, v: f64) -> f64 {
        match self {
            Precision::Half => half::f16::from_f64(v).to_f64(),
            Precision::Single => v as f32 as f64,
            Precision::Double => v,
        }
    }

    pub fn apply(self, values: &mut [f64]) {
        if self == Precision::Double {
            return;
        }
        for v in values.iter_mut() {
            *v = self.round(*v);
        }
    }
}

/// C order の多次元配列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl PredictionArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EnsembleError::InvalidArgument(format!(
                "shape {shape:?} holds {expected} values but {} were given",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// 1次元配列
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// 全要素が `value` の配列
    pub fn filled(shape: Vec<usize>, value: f64) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![value; n],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> ArrayView<'_> {
        ArrayView {
            shape: &self.shape,
            data: &self.data,
        }
    }

    /// 推定メモリ使用量（バイト）
    pub fn nbytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }
}

/// 損失関数へ渡す借用ビュー
#[derive(Debug, Clone, Copy)]
pub struct ArrayView<'a> {
    pub shape: &'a [usize],
    pub data: &'a [f64],
}

impl<'a> ArrayView<'a> {
    pub fn new(shape: &'a [usize], data: &'a [f64]) -> Self {
        Self { shape, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(PredictionArray::new(vec![2, 3], vec![0.0; 5]).is_err());
        let a = PredictionArray::new(vec![2, 3], vec![0.0; 6]).unwrap();
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.nbytes(), 48);
    }

    #[test]
    fn test_precision_rounding() {
        let v = 0.1_f64;
        assert_eq!(Precision::Double.round(v), v);
        assert_eq!(Precision::Single.round(v), 0.1_f32 as f64);
        assert_eq!(Precision::Half.round(v), half::f16::from_f64(0.1).to_f64());
        assert_ne!(Precision::Half.round(v), Precision::Single.round(v));
    }

    #[test]
    fn test_precision_from_bits() {
        assert_eq!(Precision::from_bits(16).unwrap(), Precision::Half);
        assert_eq!(Precision::from_bits(64).unwrap().bits(), 64);
        assert!(Precision::from_bits(8).is_err());
    }
}
