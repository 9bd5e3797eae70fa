use serde::Deserialize;

use crate::error::ReplayError;

// ═══════════════════════════════════════════════════════════════
//  Classifier
// ═══════════════════════════════════════════════════════════════

/// Отображение числового признака (число токенов) в одну из N
/// упорядоченных категорий.
pub trait Classifier: Send + Sync {
    /// Метка bucket'а для значения. NaN/inf и значения вне границ: ошибка.
    fn classify(&self, value: f64) -> Result<&str, ReplayError>;

    /// Все метки в порядке возрастания границ.
    fn labels(&self) -> Vec<&str>;

    /// Человекочитаемые пороги, по строке на bucket (для логов).
    fn thresholds(&self) -> Vec<String>;
}

fn check_finite(value: f64) -> Result<(), ReplayError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ReplayError::config(format!("cannot classify non-finite value {value}")))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Fixed thresholds
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_TOKEN_BOUNDS: [f64; 5] = [0.0, 256.0, 1000.0, 4000.0, 8000.0];
pub const DEFAULT_TOKEN_LABELS: [&str; 4] = ["small", "medium", "large", "xl"];

/// Фиксированные границы: `bounds.len() == labels.len() + 1`.
///
/// Интервалы `(bounds[i], bounds[i+1]]`, первый включает и нижнюю границу.
#[derive(Debug, Clone)]
pub struct FixedThresholds {
    bounds: Vec<f64>,
    labels: Vec<String>,
}

impl FixedThresholds {
    pub fn new(bounds: Vec<f64>, labels: Vec<String>) -> Result<Self, ReplayError> {
        if labels.is_empty() {
            return Err(ReplayError::config("bucket labels are empty"));
        }
        if bounds.len() != labels.len() + 1 {
            return Err(ReplayError::config(format!(
                "{} labels need {} bounds, got {}",
                labels.len(),
                labels.len() + 1,
                bounds.len()
            )));
        }
        if let Some(b) = bounds.iter().find(|b| !b.is_finite()) {
            return Err(ReplayError::config(format!("bucket bound {b} is not finite")));
        }
        if let Some(w) = bounds.windows(2).find(|w| w[1] <= w[0]) {
            return Err(ReplayError::config(format!(
                "bucket bounds must be strictly increasing: {} then {}",
                w[0], w[1]
            )));
        }
        Ok(Self { bounds, labels })
    }

    /// `[0, 256, 1000, 4000, 8000]` → small / medium / large / xl.
    pub fn token_defaults() -> Self {
        Self {
            bounds: DEFAULT_TOKEN_BOUNDS.to_vec(),
            labels: DEFAULT_TOKEN_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Classifier for FixedThresholds {
    fn classify(&self, value: f64) -> Result<&str, ReplayError> {
        check_finite(value)?;
        let lowest = self.bounds[0];
        if value >= lowest {
            for (label, upper) in self.labels.iter().zip(&self.bounds[1..]) {
                if value <= *upper {
                    return Ok(label.as_str());
                }
            }
        }
        Err(ReplayError::config(format!(
            "value {value} is outside bucket bounds [{lowest}, {}]",
            self.bounds[self.bounds.len() - 1]
        )))
    }

    fn labels(&self) -> Vec<&str> {
        self.labels.iter().map(String::as_str).collect()
    }

    fn thresholds(&self) -> Vec<String> {
        self.labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let open = if i == 0 { '[' } else { '(' };
                format!("{label}: {open}{}, {}]", self.bounds[i], self.bounds[i + 1])
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Quantile buckets
// ═══════════════════════════════════════════════════════════════

const QUANTILE_LABELS: [&str; 4] = ["1", "2", "3", "4"];

/// Четыре bucket'а по 25/50/75 перцентилям наблюдаемой колонки.
///
/// Границы могут совпадать на вырожденных данных; сравнение `<=` по
/// возрастанию делает результат детерминированным и в этом случае.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantiles {
    pub q1: f64,
    pub q2: f64,
    pub q3: f64,
}

impl Quantiles {
    pub fn from_values(values: &[f64]) -> Result<Self, ReplayError> {
        let sorted = sorted_finite(values)?;
        Ok(Self {
            q1: percentile(&sorted, 0.25),
            q2: percentile(&sorted, 0.50),
            q3: percentile(&sorted, 0.75),
        })
    }
}

impl Classifier for Quantiles {
    fn classify(&self, value: f64) -> Result<&str, ReplayError> {
        check_finite(value)?;
        let idx = if value <= self.q1 {
            0
        } else if value <= self.q2 {
            1
        } else if value <= self.q3 {
            2
        } else {
            3
        };
        Ok(QUANTILE_LABELS[idx])
    }

    fn labels(&self) -> Vec<&str> {
        QUANTILE_LABELS.to_vec()
    }

    fn thresholds(&self) -> Vec<String> {
        vec![
            format!("bucket 1: <= {:.1}", self.q1),
            format!("bucket 2: <= {:.1}", self.q2),
            format!("bucket 3: <= {:.1}", self.q3),
            format!("bucket 4:  > {:.1}", self.q3),
        ]
    }
}

fn sorted_finite(values: &[f64]) -> Result<Vec<f64>, ReplayError> {
    if values.is_empty() {
        return Err(ReplayError::config("cannot compute quantiles of an empty column"));
    }
    if let Some(v) = values.iter().find(|v| !v.is_finite()) {
        return Err(ReplayError::config(format!("column contains non-finite value {v}")));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(sorted)
}

/// Перцентиль с линейной интерполяцией между соседними рангами.
/// `sorted`: непустой, отсортированный.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

// ═══════════════════════════════════════════════════════════════
//  Strategy config
// ═══════════════════════════════════════════════════════════════

/// Выбор стратегии из конфига (`[buckets]` в TOML).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum BucketSpec {
    #[default]
    Quantile,
    Fixed {
        #[serde(default = "default_bounds")]
        bounds: Vec<f64>,
        #[serde(default = "default_labels")]
        labels: Vec<String>,
    },
}

fn default_bounds() -> Vec<f64> {
    DEFAULT_TOKEN_BOUNDS.to_vec()
}
fn default_labels() -> Vec<String> {
    DEFAULT_TOKEN_LABELS.iter().map(|s| s.to_string()).collect()
}

impl BucketSpec {
    pub fn fixed_defaults() -> Self {
        BucketSpec::Fixed { bounds: default_bounds(), labels: default_labels() }
    }

    /// Построить классификатор; `column` нужен только quantile-стратегии.
    pub fn build(&self, column: &[f64]) -> Result<Box<dyn Classifier>, ReplayError> {
        match self {
            BucketSpec::Quantile => Ok(Box::new(Quantiles::from_values(column)?)),
            BucketSpec::Fixed { bounds, labels } => {
                Ok(Box::new(FixedThresholds::new(bounds.clone(), labels.clone())?))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Column statistics
// ═══════════════════════════════════════════════════════════════

/// Описательная статистика колонки токенов.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenStats {
    pub count: usize,
    pub mean: f64,
    /// Выборочное стандартное отклонение (n - 1); NaN для одного значения.
    pub std: f64,
    pub min: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub max: f64,
}

impl TokenStats {
    pub fn from_values(values: &[f64]) -> Result<Self, ReplayError> {
        let sorted = sorted_finite(values)?;
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let std = if n > 1 {
            let var = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            var.sqrt()
        } else {
            f64::NAN
        };
        Ok(Self {
            count: n,
            mean,
            std,
            min: sorted[0],
            p25: percentile(&sorted, 0.25),
            p50: percentile(&sorted, 0.50),
            p75: percentile(&sorted, 0.75),
            max: sorted[n - 1],
        })
    }
}

/// Доля значений по каждой метке, в порядке `classifier.labels()`.
pub fn distribution(
    classifier: &dyn Classifier,
    values: &[f64],
) -> Result<Vec<(String, usize)>, ReplayError> {
    let mut counts: Vec<(String, usize)> =
        classifier.labels().into_iter().map(|l| (l.to_string(), 0)).collect();
    for v in values {
        let label = classifier.classify(*v)?;
        if let Some(slot) = counts.iter_mut().find(|(l, _)| l.as_str() == label) {
            slot.1 += 1;
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_thresholds_include_lowest_and_upper_bounds() {
        let c = FixedThresholds::new(
            vec![0.0, 256.0, 1000.0, 4000.0, 8000.0],
            vec!["small".into(), "medium".into(), "large".into(), "xl".into()],
        )
        .unwrap();
        assert_eq!(c.classify(0.0).unwrap(), "small");
        assert_eq!(c.classify(256.0).unwrap(), "small");
        assert_eq!(c.classify(257.0).unwrap(), "medium");
        assert_eq!(c.classify(1000.0).unwrap(), "medium");
        assert_eq!(c.classify(4000.5).unwrap(), "xl");
        assert_eq!(c.classify(8000.0).unwrap(), "xl");
    }

    #[test]
    fn fixed_thresholds_reject_out_of_range_and_nan() {
        let c = FixedThresholds::token_defaults();
        assert!(matches!(c.classify(8001.0), Err(ReplayError::Configuration(_))));
        assert!(matches!(c.classify(-1.0), Err(ReplayError::Configuration(_))));
        assert!(matches!(c.classify(f64::NAN), Err(ReplayError::Configuration(_))));
    }

    #[test]
    fn fixed_thresholds_require_strictly_increasing_bounds() {
        let labels = vec!["a".to_string(), "b".to_string()];
        assert!(FixedThresholds::new(vec![0.0, 10.0, 10.0], labels.clone()).is_err());
        assert!(FixedThresholds::new(vec![0.0, 20.0, 10.0], labels.clone()).is_err());
        assert!(FixedThresholds::new(vec![0.0, 10.0], labels.clone()).is_err());
        assert!(FixedThresholds::new(vec![0.0, 10.0, 20.0], labels).is_ok());
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let q = Quantiles::from_values(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(q, Quantiles { q1: 2.0, q2: 3.0, q3: 4.0 });

        let q = Quantiles::from_values(&[10.0, 20.0, 30.0, 40.0]).unwrap();
        assert!((q.q1 - 17.5).abs() < 1e-9);
        assert!((q.q2 - 25.0).abs() < 1e-9);
        assert!((q.q3 - 32.5).abs() < 1e-9);
    }

    #[test]
    fn quantile_boundaries_are_inclusive_and_stable() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0];
        let q = Quantiles::from_values(&values).unwrap();
        for _ in 0..3 {
            assert_eq!(q.classify(2.0).unwrap(), "1");
            assert_eq!(q.classify(3.0).unwrap(), "2");
            assert_eq!(q.classify(4.0).unwrap(), "3");
            assert_eq!(q.classify(4.1).unwrap(), "4");
        }
        let again = Quantiles::from_values(&values).unwrap();
        assert_eq!(q, again);
    }

    #[test]
    fn degenerate_quantiles_still_classify() {
        let q = Quantiles::from_values(&[7.0; 10]).unwrap();
        assert_eq!(q.classify(7.0).unwrap(), "1");
        assert_eq!(q.classify(8.0).unwrap(), "4");
    }

    #[test]
    fn quantiles_reject_empty_or_nan_column() {
        assert!(Quantiles::from_values(&[]).is_err());
        assert!(Quantiles::from_values(&[1.0, f64::NAN]).is_err());
    }

    #[test]
    fn token_stats_match_describe() {
        let s = TokenStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(s.count, 8);
        assert!((s.mean - 5.0).abs() < 1e-9);
        assert!((s.std - 2.138089935).abs() < 1e-6);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
        assert_eq!(s.p50, 4.5);
    }

    #[test]
    fn distribution_counts_in_label_order() {
        let c = FixedThresholds::token_defaults();
        let counts = distribution(&c, &[0.0, 100.0, 300.0, 5000.0, 7000.0]).unwrap();
        assert_eq!(
            counts,
            vec![
                ("small".to_string(), 2),
                ("medium".to_string(), 1),
                ("large".to_string(), 0),
                ("xl".to_string(), 2),
            ]
        );
    }

    #[test]
    fn bucket_spec_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            buckets: BucketSpec,
        }
        let w: Wrapper = toml::from_str("[buckets]\nstrategy = \"fixed\"\n").unwrap();
        assert_eq!(w.buckets, BucketSpec::fixed_defaults());

        let w: Wrapper = toml::from_str(
            "[buckets]\nstrategy = \"fixed\"\nbounds = [0, 10, 20]\nlabels = [\"a\", \"b\"]\n",
        )
        .unwrap();
        let c = w.buckets.build(&[]).unwrap();
        assert_eq!(c.classify(15.0).unwrap(), "b");

        let w: Wrapper = toml::from_str("[buckets]\nstrategy = \"quantile\"\n").unwrap();
        assert_eq!(w.buckets, BucketSpec::Quantile);
    }
}
