/*
    Developer blog:
    - First pass handed chunks out strictly by binding. A slow node would hold the last chunks hostage
    while the fast ones sat idle, so idle nodes now steal pending chunks bound to someone else.
    - Every strategy ends in the same place: a flat list of chunks that exactly covers the frame. The
    strategy only decides how the rectangle is cut and who gets first pick.
    - Chunk sizes come from ratios, but ratios rarely divide the resolution. The leftover pixels go to
    the last row and column instead of making a sliver chunk.
*/
use crate::{
    domains::performance_policy::PerformancePolicy,
    models::{
        chunk::{Chunk, ChunkState, Region},
        error::FarmError,
        render_node::RenderNode,
        render_setting::{RenderManagerSettings, RenderStrategy, TaskOrder},
    },
};
use std::sync::Arc;

/// Relative speed of one node for the coming frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeShare {
    pub name: String,
    pub weight: f64,
}

/// Exponential moving average over pixels per second. `alpha` is how much the newest sample counts.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialAverage {
    pub alpha: f64,
}

impl Default for ExponentialAverage {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}

impl PerformancePolicy for ExponentialAverage {
    fn update(&self, previous: Option<f64>, sample: f64) -> f64 {
        match previous {
            Some(previous) => self.alpha * sample + (1.0 - self.alpha) * previous,
            None => sample,
        }
    }
}

/// Weights for the given nodes. Unmeasured nodes are assumed average; without auto performance or
/// without any measurement every node weighs the same.
pub fn node_shares(nodes: &[Arc<RenderNode>], auto_performance: bool) -> Vec<NodeShare> {
    let measured: Vec<f64> = nodes
        .iter()
        .filter_map(|n| n.performance())
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect();
    let mean = if measured.is_empty() {
        1.0
    } else {
        measured.iter().sum::<f64>() / measured.len() as f64
    };

    nodes
        .iter()
        .map(|node| {
            let weight = match node.performance() {
                Some(p) if auto_performance && p.is_finite() && p > 0.0 => p,
                _ if auto_performance => mean,
                _ => 1.0,
            };
            NodeShare {
                name: node.name.clone(),
                weight,
            }
        })
        .collect()
}

/// Chunk size in pixels for one axis. Always at least one pixel and never more than the axis.
pub fn chunk_extent(dimension: u32, ratio: f64) -> u32 {
    ((dimension as f64 * ratio).round() as u32).clamp(1, dimension.max(1))
}

fn grid(area: Region, chunk_width: u32, chunk_height: u32) -> Vec<Region> {
    let cols = (area.width / chunk_width).max(1);
    let rows = (area.height / chunk_height).max(1);
    let mut regions = Vec::with_capacity((cols * rows) as usize);

    for row in 0..rows {
        let y = row * chunk_height;
        let height = if row == rows - 1 { area.height - y } else { chunk_height };
        for col in 0..cols {
            let x = col * chunk_width;
            let width = if col == cols - 1 { area.width - x } else { chunk_width };
            regions.push(Region::new(area.x + x, area.y + y, width, height));
        }
    }
    regions
}

/// Cut `area` into one band per weight. `horizontal` stacks the bands top to bottom.
/// Bands that round down to nothing are skipped.
fn bands(area: Region, weights: &[f64], horizontal: bool) -> Vec<(usize, Region)> {
    let total = if horizontal { area.height } else { area.width };
    let sum: f64 = weights.iter().sum();
    let equal = !(sum.is_finite() && sum > 0.0);
    let sum = if equal { weights.len() as f64 } else { sum };

    let mut result = Vec::with_capacity(weights.len());
    let mut start = 0u32;
    let mut acc = 0.0;
    for (i, weight) in weights.iter().enumerate() {
        acc += if equal { 1.0 } else { *weight };
        let end = if i == weights.len() - 1 {
            total
        } else {
            ((total as f64 * acc / sum).round() as u32).clamp(start, total)
        };
        if end > start {
            let region = if horizontal {
                Region::new(area.x, area.y + start, area.width, end - start)
            } else {
                Region::new(area.x + start, area.y, end - start, area.height)
            };
            result.push((i, region));
        }
        start = end;
    }
    result
}

fn sort_regions(regions: &mut [(Option<usize>, Region)], order: TaskOrder, frame: Region) {
    match order {
        TaskOrder::Default => regions.sort_by_key(|(_, r)| (r.y, r.x)),
        TaskOrder::Center => {
            let (cx, cy) = frame.center();
            let distance = |r: &Region| {
                let (x, y) = r.center();
                (x - cx).powi(2) + (y - cy).powi(2)
            };
            regions.sort_by(|(_, a), (_, b)| {
                distance(a)
                    .total_cmp(&distance(b))
                    .then((a.y, a.x).cmp(&(b.y, b.x)))
            });
        }
    }
}

/// Smooth weighted round robin. Deterministic, and interleaves nodes instead of handing one node a
/// run of consecutive chunks.
fn weighted_binding(count: usize, weights: &[f64]) -> Vec<usize> {
    let weights: Vec<f64> = weights
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 1.0 })
        .collect();
    let total: f64 = weights.iter().sum();
    let mut current = vec![0.0; weights.len()];
    let mut result = Vec::with_capacity(count);

    for _ in 0..count {
        let mut best = 0;
        for i in 0..weights.len() {
            current[i] += weights[i];
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        result.push(best);
    }
    result
}

/// Work list for a single frame.
#[derive(Debug)]
pub struct ChunkScheduler {
    frame: i32,
    chunks: Vec<Chunk>,
    nodes: Vec<String>,
    total_area: u64,
    done_area: u64,
    failure: Option<String>,
}

impl ChunkScheduler {
    pub fn plan(
        frame: i32,
        settings: &RenderManagerSettings,
        shares: &[NodeShare],
    ) -> Result<Self, FarmError> {
        settings.validate()?;
        if shares.is_empty() {
            return Err(FarmError::InvalidState("no connected nodes to render with".to_owned()));
        }

        let full = Region::full(settings.output_width, settings.output_height);
        let chunk_width = chunk_extent(settings.output_width, settings.chunk_width);
        let chunk_height = chunk_extent(settings.output_height, settings.chunk_height);
        let weights: Vec<f64> = shares.iter().map(|s| s.weight).collect();

        // (bound node, region)
        let mut regions: Vec<(Option<usize>, Region)> = match settings.strategy {
            RenderStrategy::Chunked => grid(full, chunk_width, chunk_height)
                .into_iter()
                .map(|r| (None, r))
                .collect(),
            RenderStrategy::SplitHorizontal => bands(full, &weights, true)
                .into_iter()
                .map(|(i, r)| (Some(i), r))
                .collect(),
            RenderStrategy::SplitVertical => bands(full, &weights, false)
                .into_iter()
                .map(|(i, r)| (Some(i), r))
                .collect(),
            RenderStrategy::SplitChunked => bands(full, &weights, true)
                .into_iter()
                .flat_map(|(i, band)| {
                    grid(band, chunk_width, chunk_height)
                        .into_iter()
                        .map(move |r| (Some(i), r))
                })
                .collect(),
        };
        sort_regions(&mut regions, settings.order, full);

        let binding = weighted_binding(regions.len(), &weights);
        let chunks: Vec<Chunk> = regions
            .into_iter()
            .enumerate()
            .map(|(id, (bound, region))| {
                let mut chunk = Chunk::new(id, frame, region);
                let owner = bound.unwrap_or(binding[id]);
                chunk.node = Some(shares[owner].name.clone());
                chunk
            })
            .collect();

        Ok(Self {
            frame,
            total_area: chunks.iter().map(|c| c.region.area()).sum(),
            chunks,
            nodes: shares.iter().map(|s| s.name.clone()).collect(),
            done_area: 0,
            failure: None,
        })
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Fraction of the frame area that is done.
    pub fn progress(&self) -> f64 {
        if self.total_area == 0 {
            return 1.0;
        }
        self.done_area as f64 / self.total_area as f64
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(Chunk::is_done)
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Nothing more will happen with this frame.
    pub fn is_settled(&self) -> bool {
        self.failure.is_some() || self.is_complete()
    }

    pub fn has_in_flight(&self) -> bool {
        self.chunks.iter().any(|c| c.state == ChunkState::InFlight)
    }

    /// Next chunk for `node`: its own pending chunks first, then anything pending it may take.
    pub fn next_for(&mut self, node: &str) -> Option<Chunk> {
        if self.failure.is_some() || !self.nodes.iter().any(|n| n == node) {
            return None;
        }

        let available = |c: &Chunk| c.state == ChunkState::Pending && !c.failed_on.iter().any(|n| n == node);
        let index = self
            .chunks
            .iter()
            .position(|c| available(c) && c.node.as_deref() == Some(node))
            .or_else(|| self.chunks.iter().position(available))?;

        let chunk = &mut self.chunks[index];
        chunk.state = ChunkState::InFlight;
        chunk.node = Some(node.to_owned());
        Some(chunk.clone())
    }

    /// Returns false if the chunk was already done, so completion is only counted once.
    pub fn complete(&mut self, id: usize) -> bool {
        let Some(chunk) = self.chunks.get_mut(id) else {
            return false;
        };
        if chunk.is_done() {
            return false;
        }
        chunk.state = ChunkState::Done;
        self.done_area += chunk.region.area();
        true
    }

    /// The renderer on `node` failed the chunk. It gets one more try on another node.
    pub fn fail_chunk(&mut self, id: usize, node: &str, reason: &str) {
        let substitute = {
            let Some(chunk) = self.chunks.get(id) else {
                return;
            };
            if chunk.is_done() {
                return;
            }
            self.nodes
                .iter()
                .filter(|n| n.as_str() != node && !chunk.failed_on.contains(*n))
                .min_by_key(|n| self.pending_for(n))
                .cloned()
        };

        let chunk = &mut self.chunks[id];
        chunk.failed_on.push(node.to_owned());
        match substitute {
            Some(other) if chunk.failed_on.len() < 2 => {
                tracing::debug!("Chunk {id} of frame {} moves from {node} to {other}", self.frame);
                chunk.state = ChunkState::Pending;
                chunk.node = Some(other);
            }
            _ => {
                chunk.state = ChunkState::Failed(reason.to_owned());
                self.failure = Some(format!("chunk {id} failed on {:?}: {reason}", chunk.failed_on));
            }
        }
    }

    /// Take a node out of this frame. Its unfinished chunks go back to pending and get spread over
    /// the remaining nodes. Returns how many chunks moved.
    pub fn remove_node(&mut self, node: &str) -> usize {
        self.nodes.retain(|n| n != node);
        let mut moved = 0;

        for id in 0..self.chunks.len() {
            let chunk = &self.chunks[id];
            let unfinished = matches!(chunk.state, ChunkState::Pending | ChunkState::InFlight);
            if !unfinished || chunk.node.as_deref() != Some(node) {
                continue;
            }

            let target = self
                .nodes
                .iter()
                .min_by_key(|n| (chunk.failed_on.contains(*n), self.pending_for(n)))
                .cloned();
            let chunk = &mut self.chunks[id];
            chunk.state = ChunkState::Pending;
            chunk.node = target;
            moved += 1;
        }

        if self.nodes.is_empty() && !self.is_complete() {
            self.failure = Some("no connected nodes left".to_owned());
        }
        moved
    }

    fn pending_for(&self, node: &str) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Pending && c.node.as_deref() == Some(node))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shares(names: &[&str]) -> Vec<NodeShare> {
        names
            .iter()
            .map(|n| NodeShare {
                name: n.to_string(),
                weight: 1.0,
            })
            .collect()
    }

    fn settings(strategy: RenderStrategy, width: u32, height: u32, ratio: f64) -> RenderManagerSettings {
        RenderManagerSettings {
            output_width: width,
            output_height: height,
            chunk_width: ratio,
            chunk_height: ratio,
            strategy,
            ..Default::default()
        }
    }

    fn assert_tiles(scheduler: &ChunkScheduler, width: u32, height: u32) {
        let chunks = scheduler.chunks();
        let area: u64 = chunks.iter().map(|c| c.region.area()).sum();
        assert_eq!(area, width as u64 * height as u64);
        for (i, a) in chunks.iter().enumerate() {
            assert!(a.region.x + a.region.width <= width);
            assert!(a.region.y + a.region.height <= height);
            for b in &chunks[i + 1..] {
                assert!(!a.region.overlaps(&b.region), "{:?} overlaps {:?}", a.region, b.region);
            }
        }
    }

    #[test]
    fn every_strategy_tiles_the_frame() {
        let strategies = [
            RenderStrategy::Chunked,
            RenderStrategy::SplitHorizontal,
            RenderStrategy::SplitVertical,
            RenderStrategy::SplitChunked,
        ];
        for strategy in strategies {
            for (w, h, ratio) in [(1920, 1080, 0.25), (1000, 777, 0.3), (7, 3, 0.5), (640, 480, 1.0)] {
                let scheduler =
                    ChunkScheduler::plan(1, &settings(strategy, w, h, ratio), &shares(&["a", "b", "c"])).unwrap();
                assert_tiles(&scheduler, w, h);
            }
        }
    }

    #[test]
    fn remainder_goes_to_last_row_and_column() {
        let scheduler = ChunkScheduler::plan(1, &settings(RenderStrategy::Chunked, 100, 100, 0.3), &shares(&["a"]))
            .unwrap();
        // 30px chunks, 3 per axis, the last one takes 40px.
        assert_eq!(scheduler.chunks().len(), 9);
        let last = scheduler.chunks().last().unwrap();
        assert_eq!(last.region, Region::new(60, 60, 40, 40));
    }

    #[test]
    fn two_by_two_grid_binds_every_chunk_once() {
        let scheduler = ChunkScheduler::plan(
            1,
            &settings(RenderStrategy::Chunked, 200, 100, 0.5),
            &shares(&["a", "b", "c"]),
        )
        .unwrap();
        assert_eq!(scheduler.chunks().len(), 4);
        assert!(scheduler.chunks().iter().all(|c| c.node.is_some()));
        let bound: Vec<&str> = scheduler.chunks().iter().filter_map(|c| c.node.as_deref()).collect();
        assert_eq!(bound, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn removed_node_chunks_are_reassigned() {
        let mut scheduler = ChunkScheduler::plan(
            1,
            &settings(RenderStrategy::Chunked, 200, 100, 0.5),
            &shares(&["a", "b", "c"]),
        )
        .unwrap();

        let in_flight = scheduler.next_for("c").unwrap();
        let moved = scheduler.remove_node("c");
        assert_eq!(moved, 1);
        assert_eq!(scheduler.chunks()[in_flight.id].state, ChunkState::Pending);

        let mut taken = Vec::new();
        while let Some(chunk) = scheduler.next_for("a").or_else(|| scheduler.next_for("b")) {
            assert_ne!(chunk.node.as_deref(), Some("c"));
            taken.push(chunk.id);
            scheduler.complete(chunk.id);
        }
        taken.sort();
        assert_eq!(taken, vec![0, 1, 2, 3]);
        assert!(scheduler.is_complete());
        assert_eq!(scheduler.progress(), 1.0);
    }

    #[test]
    fn losing_every_node_fails_the_frame() {
        let mut scheduler =
            ChunkScheduler::plan(3, &settings(RenderStrategy::Chunked, 100, 100, 0.5), &shares(&["a"])).unwrap();
        scheduler.next_for("a");
        scheduler.remove_node("a");
        assert!(scheduler.failure().is_some());
        assert!(scheduler.is_settled());
        assert!(scheduler.next_for("a").is_none());
    }

    #[test]
    fn backend_failure_is_retried_once_elsewhere() {
        let mut scheduler =
            ChunkScheduler::plan(1, &settings(RenderStrategy::Chunked, 100, 100, 1.0), &shares(&["a", "b"])).unwrap();

        let chunk = scheduler.next_for("a").unwrap();
        scheduler.fail_chunk(chunk.id, "a", "out of memory");
        assert!(scheduler.failure().is_none());
        // a may not take it back
        assert!(scheduler.next_for("a").is_none());

        let retry = scheduler.next_for("b").unwrap();
        assert_eq!(retry.id, chunk.id);
        scheduler.fail_chunk(retry.id, "b", "out of memory");
        assert!(scheduler.failure().is_some());
    }

    #[test]
    fn backend_failure_without_substitute_fails_frame() {
        let mut scheduler =
            ChunkScheduler::plan(1, &settings(RenderStrategy::Chunked, 100, 100, 0.5), &shares(&["solo"])).unwrap();
        let chunk = scheduler.next_for("solo").unwrap();
        scheduler.fail_chunk(chunk.id, "solo", "crashed");
        assert!(scheduler.failure().is_some());
    }

    #[test]
    fn progress_is_by_area() {
        // 100 wide, 30px chunks -> columns of 30, 30, 40
        let mut s = settings(RenderStrategy::Chunked, 100, 10, 0.3);
        s.chunk_height = 1.0;
        let mut scheduler = ChunkScheduler::plan(1, &s, &shares(&["a"])).unwrap();
        let last = scheduler.chunks().last().unwrap().id;
        assert!(scheduler.complete(last));
        assert!((scheduler.progress() - 0.4).abs() < 1e-9);
        assert!(!scheduler.complete(last));
        assert!((scheduler.progress() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn faster_node_gets_wider_band() {
        let shares = vec![
            NodeShare {
                name: "fast".to_owned(),
                weight: 3.0,
            },
            NodeShare {
                name: "slow".to_owned(),
                weight: 1.0,
            },
        ];
        let scheduler =
            ChunkScheduler::plan(1, &settings(RenderStrategy::SplitVertical, 400, 100, 1.0), &shares).unwrap();
        let fast = scheduler.chunks().iter().find(|c| c.node.as_deref() == Some("fast")).unwrap();
        assert_eq!(fast.region, Region::new(0, 0, 300, 100));
    }

    #[test]
    fn center_order_starts_in_the_middle() {
        let mut s = settings(RenderStrategy::Chunked, 300, 300, 1.0 / 3.0);
        s.order = TaskOrder::Center;
        let scheduler = ChunkScheduler::plan(1, &s, &shares(&["a"])).unwrap();
        assert_eq!(scheduler.chunks()[0].region, Region::new(100, 100, 100, 100));
    }

    #[test]
    fn idle_node_steals_pending_work() {
        let mut scheduler =
            ChunkScheduler::plan(1, &settings(RenderStrategy::SplitHorizontal, 100, 100, 1.0), &shares(&["a", "b"]))
                .unwrap();
        let own = scheduler.next_for("a").unwrap();
        let stolen = scheduler.next_for("a").unwrap();
        assert_ne!(own.id, stolen.id);
        assert_eq!(stolen.node.as_deref(), Some("a"));
        assert!(scheduler.next_for("b").is_none());
    }

    #[test]
    fn exponential_average_blends_samples() {
        let policy = ExponentialAverage::default();
        assert_eq!(policy.update(None, 100.0), 100.0);
        assert_eq!(policy.update(Some(100.0), 200.0), 150.0);
    }

    #[test]
    fn no_nodes_is_invalid() {
        let err = ChunkScheduler::plan(1, &RenderManagerSettings::default(), &[]).unwrap_err();
        assert!(matches!(err, FarmError::InvalidState(_)));
    }
}
