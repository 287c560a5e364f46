use crate::window::{TimeUnit, TimeWindow};

const SIZES: [(TimeUnit, &[u32]); 7] = [
    (TimeUnit::Second, &[1, 5, 10, 15, 30, 45]),
    (TimeUnit::Minute, &[1, 2, 3, 5, 10, 15, 30, 45]),
    (TimeUnit::Hour, &[1, 2, 4, 6, 8, 12]),
    (TimeUnit::Day, &[1, 2, 3]),
    (TimeUnit::Week, &[1, 2]),
    (TimeUnit::Month, &[1, 2, 3, 6]),
    (TimeUnit::Year, &[1, 2, 3, 5]),
];

/// Every timeframe the pipeline aggregates and publishes, in emission order.
pub fn timeframes() -> Vec<TimeWindow> {
    SIZES
        .iter()
        .flat_map(|(unit, sizes)| sizes.iter().map(|&size| TimeWindow::new(size, *unit)))
        .collect()
}

/// The second-resolution subset, for sinks that let downstream rollups
/// reconstruct the coarser timeframes.
pub fn only_seconds() -> Vec<TimeWindow> {
    timeframes()
        .into_iter()
        .filter(|tf| tf.unit == TimeUnit::Second)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_second_leads_the_configuration() {
        assert_eq!(timeframes()[0], TimeWindow::ONE_SECOND);
        assert_eq!(timeframes().len(), 33);
    }

    #[test]
    fn only_seconds_is_the_second_prefix() {
        let seconds = only_seconds();
        assert_eq!(seconds.len(), 6);
        assert!(seconds.iter().all(|tf| tf.unit == TimeUnit::Second));
    }
}
