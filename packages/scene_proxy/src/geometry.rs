/// A world-space transform pushed to runtime objects.
///
/// The engine treats placements as opaque values: it caches the most recent one per proxy
/// and hands it to the runtime object, but never composes or inverts them.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub struct Placement {
    /// Position in world units.
    pub translation: [f32; 3],

    /// Orientation as a unit quaternion in `[x, y, z, w]` order.
    pub rotation: [f32; 4],

    /// Per-axis scale factor.
    pub scale: [f32; 3],
}

impl Placement {
    /// The placement that leaves objects where they are.
    pub const IDENTITY: Self = Self {
        translation: [0.0; 3],
        rotation: [0.0, 0.0, 0.0, 1.0],
        scale: [1.0; 3],
    };

    /// Creates a placement from its parts.
    #[must_use]
    pub const fn new(translation: [f32; 3], rotation: [f32; 4], scale: [f32; 3]) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    /// Creates a placement that only moves objects, without rotating or scaling them.
    #[must_use]
    pub const fn from_translation(translation: [f32; 3]) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// An axis-aligned bounding box in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    min: [f32; 3],
    max: [f32; 3],
}

impl Bounds {
    /// A box that contains nothing.
    pub const EMPTY: Self = Self {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    /// Creates a box from its minimum and maximum corners.
    #[must_use]
    pub const fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// The corner with the smallest coordinates.
    #[must_use]
    pub const fn min(&self) -> [f32; 3] {
        self.min
    }

    /// The corner with the largest coordinates.
    #[must_use]
    pub const fn max(&self) -> [f32; 3] {
        self.max
    }

    /// Whether the box contains no points at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min.iter().zip(self.max.iter()).any(|(min, max)| max < min)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::float_cmp, reason = "exact values are copied around, never computed")]
mod tests {
    use super::*;

    #[test]
    fn default_placement_is_identity() {
        assert_eq!(Placement::default(), Placement::IDENTITY);

        let moved = Placement::from_translation([1.0, 2.0, 3.0]);
        assert_eq!(moved.translation, [1.0, 2.0, 3.0]);
        assert_eq!(moved.rotation, Placement::IDENTITY.rotation);
        assert_eq!(moved.scale, Placement::IDENTITY.scale);
    }

    #[test]
    fn empty_bounds() {
        assert!(Bounds::EMPTY.is_empty());
        assert!(!Bounds::new([0.0; 3], [0.0; 3]).is_empty());
        assert!(Bounds::new([0.0, 1.0, 0.0], [1.0, 0.0, 1.0]).is_empty());
    }
}
