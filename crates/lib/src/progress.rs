//! Progress reporting.

/// Receives completion percentages (0..=100) for a unit of work.
pub trait ProgressObserver: Send + Sync {
  fn progress(&self, percent: u32);
}

impl<F> ProgressObserver for F
where
  F: Fn(u32) + Send + Sync,
{
  fn progress(&self, percent: u32) {
    self(percent)
  }
}

/// Discards all progress.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
  fn progress(&self, _percent: u32) {}
}

/// Folds per-element progress into a single percentage weighted by element size.
///
/// Owned by one task; workers report through events rather than touching this directly. Only
/// increases are reported so the aggregate never moves backwards.
#[derive(Debug)]
pub struct ProgressAggregator {
  sizes: Vec<u64>,
  progress: Vec<u32>,
  reported: Option<u32>,
}

impl ProgressAggregator {
  pub fn new(sizes: Vec<u64>) -> Self {
    // With nothing to weigh by, every element counts the same.
    let sizes = if sizes.iter().all(|&s| s == 0) {
      vec![1; sizes.len()]
    } else {
      sizes
    };
    let progress = vec![0; sizes.len()];
    Self {
      sizes,
      progress,
      reported: None,
    }
  }

  /// Records `percent` for element `index` and returns the new aggregate if it increased.
  pub fn update(&mut self, index: usize, percent: u32) -> Option<u32> {
    let slot = self.progress.get_mut(index)?;
    *slot = percent.min(100);

    let aggregate = self.aggregate();
    if self.reported.is_some_and(|prev| aggregate <= prev) {
      return None;
    }
    self.reported = Some(aggregate);
    Some(aggregate)
  }

  pub fn aggregate(&self) -> u32 {
    let total: u128 = self.sizes.iter().map(|&s| s as u128).sum();
    if total == 0 {
      return 100;
    }
    let done: u128 = self
      .sizes
      .iter()
      .zip(&self.progress)
      .map(|(&size, &pct)| size as u128 * pct as u128 / 100)
      .sum();
    (done * 100 / total) as u32
  }
}
