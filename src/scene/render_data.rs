//! Per-camera render queues
//!
//! Scene traversal appends visible items to buckets keyed by render queue
//! and pass. Buckets are cleared and rebuilt once per frame per camera.

use super::light::LightKind;
use super::{DrawableId, LightId, ProbeId};

/// Coarse render-queue tag assigned during scene traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderQueue {
    Opaque,
    Transparent,
    Lighting,
    Shadow,
    LightProbe,
    PostProcess,
}

/// Split of the opaque queue for state-change minimization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpaquePass {
    /// Shaded by the shared deferred composite
    Batch,
    /// Shaded by the material's own pass
    Specific,
}

/// A (queue, pass) pair naming one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderBucket {
    Opaque(OpaquePass),
    Transparent,
    Lighting(LightKind),
    Shadow,
    LightProbe,
    PostProcess,
}

impl RenderBucket {
    const COUNT: usize = 6 + LightKind::ALL.len();

    pub fn queue(&self) -> RenderQueue {
        match self {
            RenderBucket::Opaque(_) => RenderQueue::Opaque,
            RenderBucket::Transparent => RenderQueue::Transparent,
            RenderBucket::Lighting(_) => RenderQueue::Lighting,
            RenderBucket::Shadow => RenderQueue::Shadow,
            RenderBucket::LightProbe => RenderQueue::LightProbe,
            RenderBucket::PostProcess => RenderQueue::PostProcess,
        }
    }

    fn index(&self) -> usize {
        match self {
            RenderBucket::Opaque(OpaquePass::Batch) => 0,
            RenderBucket::Opaque(OpaquePass::Specific) => 1,
            RenderBucket::Transparent => 2,
            RenderBucket::Shadow => 3,
            RenderBucket::LightProbe => 4,
            RenderBucket::PostProcess => 5,
            RenderBucket::Lighting(kind) => 6 + *kind as usize,
        }
    }
}

/// One entry of a bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderItem {
    /// A drawable with its view-space distance from the camera
    Drawable { id: DrawableId, distance: f32 },
    Light(LightId),
    Probe(ProbeId),
}

/// Visible items of one camera, bucketed by queue
#[derive(Debug, Clone)]
pub struct RenderDataManager {
    buckets: Vec<Vec<RenderItem>>,
}

impl Default for RenderDataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDataManager {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); RenderBucket::COUNT],
        }
    }

    /// Empty every bucket, keeping allocations.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    pub fn push(&mut self, bucket: RenderBucket, item: RenderItem) {
        self.buckets[bucket.index()].push(item);
    }

    pub fn get_render_data(&self, bucket: RenderBucket) -> &[RenderItem] {
        &self.buckets[bucket.index()]
    }

    pub fn is_empty(&self, bucket: RenderBucket) -> bool {
        self.buckets[bucket.index()].is_empty()
    }

    pub fn total_items(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Drawable ids of a bucket in order.
    pub fn drawables(&self, bucket: RenderBucket) -> impl Iterator<Item = DrawableId> + '_ {
        self.get_render_data(bucket).iter().filter_map(|item| match item {
            RenderItem::Drawable { id, .. } => Some(*id),
            _ => None,
        })
    }

    /// Light ids of one lighting bucket in order.
    pub fn lights(&self, kind: LightKind) -> impl Iterator<Item = LightId> + '_ {
        self.get_render_data(RenderBucket::Lighting(kind))
            .iter()
            .filter_map(|item| match item {
                RenderItem::Light(id) => Some(*id),
                _ => None,
            })
    }

    pub fn probes(&self) -> impl Iterator<Item = ProbeId> + '_ {
        self.get_render_data(RenderBucket::LightProbe)
            .iter()
            .filter_map(|item| match item {
                RenderItem::Probe(id) => Some(*id),
                _ => None,
            })
    }

    /// Order the transparent bucket farthest first.
    pub fn sort_back_to_front(&mut self) {
        let bucket = &mut self.buckets[RenderBucket::Transparent.index()];
        bucket.sort_by(|a, b| distance(b).total_cmp(&distance(a)));
    }
}

fn distance(item: &RenderItem) -> f32 {
    match item {
        RenderItem::Drawable { distance, .. } => *distance,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_are_independent() {
        let mut data = RenderDataManager::new();
        data.push(
            RenderBucket::Opaque(OpaquePass::Batch),
            RenderItem::Drawable {
                id: DrawableId(0),
                distance: 1.0,
            },
        );
        data.push(RenderBucket::Lighting(LightKind::Spot), RenderItem::Light(LightId(2)));

        assert_eq!(data.get_render_data(RenderBucket::Opaque(OpaquePass::Batch)).len(), 1);
        assert!(data.is_empty(RenderBucket::Opaque(OpaquePass::Specific)));
        assert_eq!(data.lights(LightKind::Spot).collect::<Vec<_>>(), vec![LightId(2)]);
        assert_eq!(data.lights(LightKind::Point).count(), 0);
        assert_eq!(data.total_items(), 2);

        data.clear();
        assert_eq!(data.total_items(), 0);
    }

    #[test]
    fn test_back_to_front() {
        let mut data = RenderDataManager::new();
        for (id, distance) in [(0, 2.0), (1, 9.0), (2, 5.0)] {
            data.push(
                RenderBucket::Transparent,
                RenderItem::Drawable {
                    id: DrawableId(id),
                    distance,
                },
            );
        }
        data.sort_back_to_front();
        let order: Vec<_> = data.drawables(RenderBucket::Transparent).collect();
        assert_eq!(order, vec![DrawableId(1), DrawableId(2), DrawableId(0)]);
    }

    #[test]
    fn test_bucket_queue_tags() {
        assert_eq!(RenderBucket::Opaque(OpaquePass::Specific).queue(), RenderQueue::Opaque);
        assert_eq!(
            RenderBucket::Lighting(LightKind::Ambient).queue(),
            RenderQueue::Lighting
        );
    }
}
