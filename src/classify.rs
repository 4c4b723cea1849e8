use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ScaleError {
    #[error("color palette is empty")]
    EmptyPalette,
}

/// Ordered class colors (low to high) plus the color used for missing data.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    pub colors: Vec<String>,
    pub no_data: String,
}

/// Result of classifying a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Bin(usize),
    NoData,
}

impl Class {
    pub fn index(self) -> Option<usize> {
        match self {
            Class::Bin(i) => Some(i),
            Class::NoData => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LegendEntry {
    pub class: usize,
    pub color: String,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantileScale {
    domain: Vec<f64>,
    thresholds: Vec<f64>,
    palette: Palette,
}

impl QuantileScale {
    /// Breakpoints come from the finite values only; NaN never shifts a boundary.
    pub fn new<I>(values: I, palette: Palette) -> Result<Self, ScaleError>
    where
        I: IntoIterator<Item = f64>,
    {
        if palette.colors.is_empty() {
            return Err(ScaleError::EmptyPalette);
        }

        let mut domain: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        domain.sort_by(|a, b| a.total_cmp(b));

        let classes = palette.colors.len();
        let thresholds = if domain.is_empty() {
            Vec::new()
        } else {
            (1..classes)
                .map(|i| quantile_sorted(&domain, i as f64 / classes as f64))
                .collect()
        };

        Ok(Self {
            domain,
            thresholds,
            palette,
        })
    }

    pub fn classes(&self) -> usize {
        self.palette.colors.len()
    }

    /// Interior class boundaries, ascending.
    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Sorted finite values the scale was built from.
    pub fn domain(&self) -> &[f64] {
        &self.domain
    }

    pub fn classify(&self, value: f64) -> Class {
        if !value.is_finite() {
            return Class::NoData;
        }
        Class::Bin(self.thresholds.partition_point(|t| *t <= value))
    }

    pub fn color_of_class(&self, class: Class) -> &str {
        match class {
            Class::Bin(i) => &self.palette.colors[i],
            Class::NoData => &self.palette.no_data,
        }
    }

    pub fn color(&self, value: f64) -> &str {
        self.color_of_class(self.classify(value))
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes()];
        for value in &self.domain {
            if let Class::Bin(i) = self.classify(*value) {
                counts[i] += 1;
            }
        }
        counts
    }

    pub fn legend(&self) -> Vec<LegendEntry> {
        let counts = self.class_counts();
        let min = self.domain.first().copied();
        let max = self.domain.last().copied();

        self.palette
            .colors
            .iter()
            .enumerate()
            .map(|(i, color)| LegendEntry {
                class: i,
                color: color.clone(),
                lower: if i == 0 {
                    min
                } else {
                    self.thresholds.get(i - 1).copied()
                },
                upper: self.thresholds.get(i).copied().or(max),
                count: counts[i],
            })
            .collect()
    }
}

// Linear interpolation between closest ranks; `sorted` must be non-empty.
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 || p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[n - 1];
    }
    let h = (n - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}
