//! Affine transform math for placed objects
//!
//! The container format stores placement as 12 coefficients: a row-major
//! 4x3 affine matrix where rows 0-2 are the linear part (rotation, scale,
//! shear) and row 3 (indices 9..12) is the translation. Points are row
//! vectors, so applying transform A and then B composes as `A.then(B)`.

use crate::error::GeometryError;
use serde::Serialize;
use std::fmt;

/// Number of coefficients in a container transform attribute
pub const TRANSFORM_COEFFICIENTS: usize = 12;

/// A 3x4 affine transform in the container's row-major layout
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform([f64; TRANSFORM_COEFFICIENTS]);

impl Transform {
    /// The identity transform
    pub const IDENTITY: Transform = Transform([
        1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, //
        0.0, 0.0, 1.0, //
        0.0, 0.0, 0.0,
    ]);

    /// Build a transform from raw coefficients
    pub fn from_coefficients(coefficients: [f64; TRANSFORM_COEFFICIENTS]) -> Self {
        Transform(coefficients)
    }

    /// Build a pure translation
    pub fn translation_of(x: f64, y: f64, z: f64) -> Self {
        let mut m = Self::IDENTITY.0;
        m[9] = x;
        m[10] = y;
        m[11] = z;
        Transform(m)
    }

    /// Parse the whitespace-separated attribute form
    ///
    /// Exactly 12 finite values are required; anything else is rejected so a
    /// malformed attribute never silently degrades to the identity.
    pub fn parse(attr: &str) -> Result<Self, GeometryError> {
        let mut values = [0.0f64; TRANSFORM_COEFFICIENTS];
        let mut count = 0;
        for token in attr.split_whitespace() {
            if count == TRANSFORM_COEFFICIENTS {
                count += 1;
                break;
            }
            let value: f64 = token
                .parse()
                .map_err(|_| GeometryError::BadTransform(format!("non-numeric token '{token}'")))?;
            if !value.is_finite() {
                return Err(GeometryError::BadTransform(format!(
                    "non-finite coefficient '{token}'"
                )));
            }
            values[count] = value;
            count += 1;
        }
        if count != TRANSFORM_COEFFICIENTS {
            return Err(GeometryError::BadTransform(format!(
                "expected {TRANSFORM_COEFFICIENTS} coefficients, got {count} in '{attr}'"
            )));
        }
        Ok(Transform(values))
    }

    /// Raw coefficients in the container's row-major layout
    pub fn coefficients(&self) -> &[f64; TRANSFORM_COEFFICIENTS] {
        &self.0
    }

    /// The translation row
    pub fn translation(&self) -> [f64; 3] {
        [self.0[9], self.0[10], self.0[11]]
    }

    /// Whether this is (approximately) the identity
    pub fn is_identity(&self) -> bool {
        self.0
            .iter()
            .zip(Self::IDENTITY.0.iter())
            .all(|(a, b)| (a - b).abs() < 1e-12)
    }

    /// Apply this transform to a point
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        [
            p[0] * m[0] + p[1] * m[3] + p[2] * m[6] + m[9],
            p[0] * m[1] + p[1] * m[4] + p[2] * m[7] + m[10],
            p[0] * m[2] + p[1] * m[5] + p[2] * m[8] + m[11],
        ]
    }

    /// Sequential composition: apply `self` first, then `next`
    ///
    /// Matches the container's component nesting: a component's local
    /// transform composes with its ancestors as
    /// `component.then(item)`. Composition is associative.
    pub fn then(&self, next: &Transform) -> Transform {
        let a = &self.0;
        let b = &next.0;
        let mut out = [0.0f64; TRANSFORM_COEFFICIENTS];
        // Linear part: row-vector product of the two 3x3 blocks.
        for row in 0..3 {
            for col in 0..3 {
                let mut sum = 0.0;
                for k in 0..3 {
                    sum += a[row * 3 + k] * b[k * 3 + col];
                }
                out[row * 3 + col] = sum;
            }
        }
        // Translation: self's translation through next's linear part, plus
        // next's translation.
        for col in 0..3 {
            out[9 + col] =
                a[9] * b[col] + a[10] * b[3 + col] + a[11] * b[6 + col] + b[9 + col];
        }
        Transform(out)
    }

    /// Axis-aligned bounding box of a transformed box
    ///
    /// Transforms all 8 corners and takes the min/max. Applying only the
    /// translation row drops rotation and scale contributions and produces
    /// wrong bounds for anything but axis-aligned placements.
    pub fn apply_aabb(&self, aabb: &Aabb) -> Aabb {
        if aabb.is_empty() {
            return Aabb::EMPTY;
        }
        let mut out = Aabb::EMPTY;
        for corner in aabb.corners() {
            out.include(self.apply(corner));
        }
        out
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            // Trim trailing zeros the way authoring tools do.
            if *v == v.trunc() && v.abs() < 1e15 {
                write!(f, "{}", *v as i64)?;
            } else {
                write!(f, "{v}")?;
            }
        }
        Ok(())
    }
}

/// An axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: [f64; 3],
    /// Maximum corner
    pub max: [f64; 3],
}

impl Aabb {
    /// The empty box (min at +inf, max at -inf); unioning with it is a no-op
    pub const EMPTY: Aabb = Aabb {
        min: [f64::INFINITY; 3],
        max: [f64::NEG_INFINITY; 3],
    };

    /// Build from explicit corners
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Aabb { min, max }
    }

    /// Whether no point has been included yet
    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    /// Grow to include a point
    pub fn include(&mut self, p: [f64; 3]) {
        for i in 0..3 {
            if p[i] < self.min[i] {
                self.min[i] = p[i];
            }
            if p[i] > self.max[i] {
                self.max[i] = p[i];
            }
        }
    }

    /// Union of two boxes
    pub fn union(&self, other: &Aabb) -> Aabb {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut out = *self;
        out.include(other.min);
        out.include(other.max);
        out
    }

    /// Whether a point lies inside the box (inclusive)
    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// Extent per axis (zero for the empty box)
    pub fn size(&self) -> [f64; 3] {
        if self.is_empty() {
            return [0.0; 3];
        }
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// The 8 corners of the box
    pub fn corners(&self) -> [[f64; 3]; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            [lo[0], lo[1], lo[2]],
            [hi[0], lo[1], lo[2]],
            [lo[0], hi[1], lo[2]],
            [hi[0], hi[1], lo[2]],
            [lo[0], lo[1], hi[2]],
            [hi[0], lo[1], hi[2]],
            [lo[0], hi[1], hi[2]],
            [hi[0], hi[1], hi[2]],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn assert_close(a: [f64; 3], b: [f64; 3]) {
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < EPS, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn identity_leaves_bounds_unchanged() {
        let aabb = Aabb::new([-1.0, 2.0, 0.0], [3.0, 5.0, 7.0]);
        let out = Transform::IDENTITY.apply_aabb(&aabb);
        assert_close(out.min, aabb.min);
        assert_close(out.max, aabb.max);
    }

    #[test]
    fn parse_round_trips_attribute_form() {
        let t = Transform::parse("1 0 0 0 1 0 0 0 1 135 135 10").unwrap();
        assert_eq!(t.translation(), [135.0, 135.0, 10.0]);
        let again = Transform::parse(&t.to_string()).unwrap();
        assert_eq!(t, again);
    }

    #[test]
    fn parse_rejects_wrong_arity_and_garbage() {
        assert!(Transform::parse("1 0 0").is_err());
        assert!(Transform::parse("1 0 0 0 1 0 0 0 1 0 0 0 5").is_err());
        assert!(Transform::parse("1 0 0 0 1 0 0 0 x 0 0 0").is_err());
        assert!(Transform::parse("1 0 0 0 1 0 0 0 inf 0 0 0").is_err());
    }

    #[test]
    fn rotation_grows_bounds_correctly() {
        // 90 degrees about Z: x -> y, y -> -x.
        let rot = Transform::from_coefficients([
            0.0, 1.0, 0.0, //
            -1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, //
            0.0, 0.0, 0.0,
        ]);
        let aabb = Aabb::new([0.0, 0.0, 0.0], [10.0, 2.0, 1.0]);
        let out = rot.apply_aabb(&aabb);
        assert_close(out.min, [-2.0, 0.0, 0.0]);
        assert_close(out.max, [0.0, 10.0, 1.0]);
    }

    #[test]
    fn translation_only_application_would_be_wrong_under_rotation() {
        // The defect this module guards against: applying the translation
        // row alone to a rotated object keeps the unrotated extents.
        let rot = Transform::from_coefficients([
            0.0, 1.0, 0.0, //
            -1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, //
            50.0, 0.0, 0.0,
        ]);
        let aabb = Aabb::new([0.0, 0.0, 0.0], [10.0, 2.0, 1.0]);
        let correct = rot.apply_aabb(&aabb);
        let naive = Aabb::new([50.0, 0.0, 0.0], [60.0, 2.0, 1.0]);
        assert!((correct.min[0] - 48.0).abs() < EPS);
        assert_ne!(correct, naive);
    }

    #[test]
    fn then_matches_sequential_application() {
        let a = Transform::parse("0 1 0 -1 0 0 0 0 1 5 0 0").unwrap();
        let b = Transform::translation_of(0.0, 10.0, -2.0);
        let p = [3.0, 4.0, 5.0];
        assert_close(a.then(&b).apply(p), b.apply(a.apply(p)));
    }

    fn arb_transform() -> impl Strategy<Value = Transform> {
        proptest::array::uniform12(-10.0f64..10.0).prop_map(Transform::from_coefficients)
    }

    proptest! {
        #[test]
        fn compose_then_apply_equals_apply_in_sequence(
            a in arb_transform(),
            b in arb_transform(),
            p in proptest::array::uniform3(-100.0f64..100.0),
        ) {
            let composed = a.then(&b).apply(p);
            let sequential = b.apply(a.apply(p));
            for i in 0..3 {
                prop_assert!((composed[i] - sequential[i]).abs() < 1e-6);
            }
        }

        #[test]
        fn composition_is_associative(
            a in arb_transform(),
            b in arb_transform(),
            c in arb_transform(),
            p in proptest::array::uniform3(-10.0f64..10.0),
        ) {
            let left = a.then(&b).then(&c).apply(p);
            let right = a.then(&b.then(&c)).apply(p);
            for i in 0..3 {
                prop_assert!((left[i] - right[i]).abs() < 1e-5);
            }
        }
    }
}
