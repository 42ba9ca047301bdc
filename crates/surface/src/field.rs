use crate::error::{Result, SurfaceError};

/// A dense 3-D grid of intensities.
///
/// Samples are stored x fastest, so `value(i, j, k)` lives at `i + nx * (j + ny * k)`.
/// `spacing` is the physical distance between neighbouring samples along each axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarField {
    dims: [usize; 3],
    spacing: [f32; 3],
    values: Vec<f32>,
}

impl ScalarField {
    pub fn new(dims: [usize; 3], spacing: [f32; 3], values: Vec<f32>) -> Result<Self> {
        let expected = dims.iter().product::<usize>();
        if expected == 0 {
            return Err(SurfaceError::InvalidField(format!("empty grid {dims:?}")));
        }
        if values.len() != expected {
            return Err(SurfaceError::InvalidField(format!(
                "{} values for a {}x{}x{} grid",
                values.len(),
                dims[0],
                dims[1],
                dims[2]
            )));
        }
        if let Some(s) = spacing.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(SurfaceError::InvalidField(format!("spacing {s} is not positive")));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(SurfaceError::InvalidField(format!(
                "non-finite value at index {index}"
            )));
        }
        Ok(Self {
            dims,
            spacing,
            values,
        })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn spacing(&self) -> [f32; 3] {
        self.spacing
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.dims[0] * (j + self.dims[1] * k)
    }

    #[inline]
    pub fn value(&self, i: usize, j: usize, k: usize) -> f32 {
        self.values[self.index(i, j, k)]
    }

    pub fn min_max(&self) -> (f32, f32) {
        self.values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    pub fn with_spacing(self, spacing: [f32; 3]) -> Result<Self> {
        Self::new(self.dims, spacing, self.values)
    }
}

/// Rescales every sample to `(v - min) / (max - min)`, so the result spans exactly `[0, 1]`.
pub fn normalize(field: &ScalarField) -> Result<ScalarField> {
    let (lo, hi) = field.min_max();
    if hi == lo {
        return Err(SurfaceError::DegenerateField(lo));
    }
    let range = f64::from(hi) - f64::from(lo);
    let values = field
        .values
        .iter()
        .map(|&v| ((f64::from(v) - f64::from(lo)) / range) as f32)
        .collect();
    Ok(ScalarField {
        dims: field.dims,
        spacing: field.spacing,
        values,
    })
}

/// Isosurface level: one population standard deviation above the mean.
pub fn choose_threshold(field: &ScalarField) -> f32 {
    let n = field.values.len() as f64;
    let mean = field.values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let variance = field
        .values
        .iter()
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean + variance.sqrt()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    #[test]
    fn rejects_bad_fields() {
        assert!(ScalarField::new([2, 2, 2], [1.0; 3], vec![0.0; 7]).is_err());
        assert!(ScalarField::new([0, 2, 2], [1.0; 3], vec![]).is_err());
        assert!(ScalarField::new([1, 1, 1], [1.0, 0.0, 1.0], vec![0.0]).is_err());
        assert!(ScalarField::new([1, 1, 1], [1.0; 3], vec![f32::NAN]).is_err());
    }

    #[test]
    fn x_is_fastest() {
        let values = (0..6).map(|v| v as f32).collect();
        let field = ScalarField::new([2, 3, 1], [1.0; 3], values).unwrap();
        assert_eq!(field.value(1, 0, 0), 1.0);
        assert_eq!(field.value(0, 1, 0), 2.0);
        assert_eq!(field.value(1, 2, 0), 5.0);
    }

    #[test]
    fn normalize_spans_unit_range() {
        let field = ScalarField::new([4, 1, 1], [1.0; 3], vec![-2.0, 0.0, 2.0, 6.0]).unwrap();
        let n = normalize(&field).unwrap();
        assert_eq!(n.values(), &[0.0, 0.25, 0.5, 1.0]);
        assert_eq!(n.min_max(), (0.0, 1.0));
    }

    #[test]
    fn normalize_constant_field() {
        let field = ScalarField::new([2, 2, 2], [1.0; 3], vec![3.0; 8]).unwrap();
        assert!(matches!(normalize(&field), Err(SurfaceError::DegenerateField(v)) if v == 3.0));
    }

    #[test]
    fn threshold_is_mean_plus_std() {
        // mean 0.25, population std sqrt(0.1875)
        let field = ScalarField::new([4, 1, 1], [1.0; 3], vec![0.0, 0.0, 0.0, 1.0]).unwrap();
        assert_float_eq!(choose_threshold(&field), 0.25 + 0.1875f32.sqrt(), abs <= 1e-6);
    }
}
