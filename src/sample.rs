use serde::{Deserialize, Serialize};

/// One retained point of a reduced series: original position plus value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub position: usize,
    pub value: f64,
}

/// Bounded, order-preserving subset of a metric series. The global
/// extrema of the source are always retained (cap permitting), so plots
/// over the sample keep the source's vertical range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledSeries {
    pub points: Vec<SamplePoint>,
    pub source_len: usize,
}

impl SampledSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Deterministically reduce `series` to at most `cap` points.
///
/// Identity when the series already fits. Otherwise evenly spaced anchor
/// positions are chosen and the nearest anchors are substituted with the
/// first occurrences of the global minimum and maximum. No randomness:
/// the same `(series, cap)` pair always yields the same sample.
pub fn sample(series: &[f64], cap: usize) -> SampledSeries {
    let len = series.len();
    if len <= cap {
        return SampledSeries {
            points: series
                .iter()
                .enumerate()
                .map(|(position, &value)| SamplePoint { position, value })
                .collect(),
            source_len: len,
        };
    }
    if cap == 0 {
        return SampledSeries {
            points: Vec::new(),
            source_len: len,
        };
    }

    let min_index = argmin(series);
    let max_index = argmax(series);

    let mut picked: Vec<usize> = if cap == 1 {
        vec![min_index]
    } else {
        // len > cap >= 2, so these are strictly increasing and distinct
        (0..cap).map(|i| i * (len - 1) / (cap - 1)).collect()
    };
    substitute_nearest(&mut picked, min_index, None);
    if max_index != min_index {
        substitute_nearest(&mut picked, max_index, Some(min_index));
    }

    SampledSeries {
        points: picked
            .into_iter()
            .map(|position| SamplePoint {
                position,
                value: series[position],
            })
            .collect(),
        source_len: len,
    }
}

/// Replace the anchor closest to `target` (ties toward the earlier anchor)
/// unless the target is already picked. `protected` shields a previously
/// substituted extremum from being overwritten.
fn substitute_nearest(picked: &mut Vec<usize>, target: usize, protected: Option<usize>) {
    if picked.binary_search(&target).is_ok() {
        return;
    }
    let mut best: Option<(usize, usize)> = None;
    for (slot, &index) in picked.iter().enumerate() {
        if Some(index) == protected {
            continue;
        }
        let distance = index.abs_diff(target);
        if best.map(|(_, d)| distance < d).unwrap_or(true) {
            best = Some((slot, distance));
        }
    }
    if let Some((slot, _)) = best {
        picked[slot] = target;
        picked.sort_unstable();
    }
}

fn argmin(series: &[f64]) -> usize {
    let mut best = 0usize;
    for (index, &value) in series.iter().enumerate() {
        if value < series[best] {
            best = index;
        }
    }
    best
}

fn argmax(series: &[f64]) -> usize {
    let mut best = 0usize;
    for (index, &value) in series.iter().enumerate() {
        if value > series[best] {
            best = index;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(sampled: &SampledSeries) -> Vec<f64> {
        sampled.points.iter().map(|point| point.value).collect()
    }

    #[test]
    fn identity_under_cap() {
        let series = vec![3.0, 1.0, 2.0];
        let sampled = sample(&series, 10);
        assert_eq!(sampled.len(), 3);
        assert_eq!(values(&sampled), series);
        assert_eq!(sampled.points[1].position, 1);
    }

    #[test]
    fn retains_extrema() {
        let mut series: Vec<f64> = (0..1000).map(|i| (i as f64).sin()).collect();
        series[317] = -50.0;
        series[901] = 75.0;
        let sampled = sample(&series, 20);
        assert!(sampled.len() <= 20);
        let sampled_values = values(&sampled);
        assert!(sampled_values.contains(&-50.0));
        assert!(sampled_values.contains(&75.0));
    }

    #[test]
    fn deterministic() {
        let series: Vec<f64> = (0..500).map(|i| ((i * 37) % 113) as f64).collect();
        let first = sample(&series, 50);
        let second = sample(&series, 50);
        assert_eq!(first, second);
    }

    #[test]
    fn positions_strictly_increasing() {
        let series: Vec<f64> = (0..300).map(|i| (i % 7) as f64).collect();
        let sampled = sample(&series, 25);
        assert!(
            sampled
                .points
                .windows(2)
                .all(|pair| pair[0].position < pair[1].position)
        );
    }

    #[test]
    fn constant_series() {
        let series = vec![5.0; 100];
        let sampled = sample(&series, 4);
        assert_eq!(sampled.len(), 4);
        assert!(values(&sampled).iter().all(|&value| value == 5.0));
    }

    #[test]
    fn cap_zero_and_one() {
        let series = vec![2.0, 9.0, 1.0, 4.0];
        assert!(sample(&series, 0).is_empty());
        let one = sample(&series, 1);
        assert_eq!(one.len(), 1);
        assert_eq!(one.points[0].value, 1.0);
    }

    #[test]
    fn extrema_at_edges() {
        let mut series = vec![0.5; 64];
        series[0] = -1.0;
        series[63] = 2.0;
        let sampled = sample(&series, 8);
        let sampled_values = values(&sampled);
        assert!(sampled_values.contains(&-1.0));
        assert!(sampled_values.contains(&2.0));
        assert_eq!(sampled.len(), 8);
    }
}
