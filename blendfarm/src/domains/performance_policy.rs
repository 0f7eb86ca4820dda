/// How a node's measured speed feeds back into its share of the next frame.
///
/// Speed is measured in rendered pixels per second. The result is stored on the node, so the
/// history carries over frames and tasks for as long as the node stays in the farm.
pub trait PerformancePolicy: Send + Sync {
    /// Fold a new sample into the previous estimate.
    fn update(&self, previous: Option<f64>, sample: f64) -> f64;
}
