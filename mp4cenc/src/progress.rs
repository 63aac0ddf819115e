//! Decryption progress reporting.

/// Receives one callback per processed sample of the protected tracks.
///
/// `step` starts at 1 and runs through `total`, which is known before
/// the first call and never changes during a run. Clear samples inside
/// protected tracks count as steps too, so the sequence is strictly
/// 1, 2, .., total.
pub trait ProgressListener {
    fn on_progress(&mut self, step: u64, total: u64);
}

/// Listener that ignores every update.
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_progress(&mut self, _step: u64, _total: u64) {}
}

/// Adapter implementing [`ProgressListener`] for a closure.
///
/// ```
/// use mp4cenc::{ProgressFn, ProgressListener};
///
/// let mut listener = ProgressFn(|step, total| eprintln!("{}/{}", step, total));
/// listener.on_progress(1, 10);
/// ```
pub struct ProgressFn<F>(pub F);

impl<F: FnMut(u64, u64)> ProgressListener for ProgressFn<F> {
    fn on_progress(&mut self, step: u64, total: u64) {
        (self.0)(step, total)
    }
}
