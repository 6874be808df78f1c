use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};
use serde::{Deserialize, Serialize};




/**
 * A 3D vector
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}




// ============================================================================
impl Vector3d {

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm_squared(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.norm_squared().sqrt()
    }

    pub fn component(&self, axis: Axis) -> f64 {
        match axis {
            Axis::I => self.x,
            Axis::J => self.y,
            Axis::K => self.z,
        }
    }

    pub fn set_component(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::I => self.x = value,
            Axis::J => self.y = value,
            Axis::K => self.z = value,
        }
    }

    /**
     * Return a copy of this vector with the component along the given axis
     * negated.
     */
    pub fn reflect(&self, axis: Axis) -> Self {
        let mut v = *self;
        v.set_component(axis, -self.component(axis));
        v
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vector3d {
    type Output = Self;
    fn add(self, v: Self) -> Self {
        Self::new(self.x + v.x, self.y + v.y, self.z + v.z)
    }
}

impl Sub for Vector3d {
    type Output = Self;
    fn sub(self, v: Self) -> Self {
        Self::new(self.x - v.x, self.y - v.y, self.z - v.z)
    }
}

impl Mul<f64> for Vector3d {
    type Output = Self;
    fn mul(self, a: f64) -> Self {
        Self::new(self.x * a, self.y * a, self.z * a)
    }
}

impl Neg for Vector3d {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl AddAssign for Vector3d {
    fn add_assign(&mut self, v: Self) {
        self.x += v.x;
        self.y += v.y;
        self.z += v.z;
    }
}

impl SubAssign for Vector3d {
    fn sub_assign(&mut self, v: Self) {
        self.x -= v.x;
        self.y -= v.y;
        self.z -= v.z;
    }
}




/**
 * Identifier for a Cartesian axis of a block's index space
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    I,
    J,
    K,
}




// ============================================================================
impl Axis {

    pub const ALL: [Axis; 3] = [Axis::I, Axis::J, Axis::K];

    /**
     * The axes that carry more than one cell in a block of the given
     * dimensionality.
     */
    pub fn active(dimensions: usize) -> &'static [Axis] {
        if dimensions == 2 {
            &Self::ALL[..2]
        } else {
            &Self::ALL
        }
    }

    pub fn index(self) -> usize {
        match self {
            Axis::I => 0,
            Axis::J => 1,
            Axis::K => 2,
        }
    }

    pub fn along(self, other: Axis) -> f64 {
        if self == other {
            1.0
        } else {
            0.0
        }
    }

    pub fn unit(self) -> Vector3d {
        Vector3d::new(self.along(Axis::I), self.along(Axis::J), self.along(Axis::K))
    }
}




/**
 * One of the six bounding faces of a block. The declaration order matches the
 * numbering used in face-indexed file names.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Face {
    North,
    East,
    South,
    West,
    Top,
    Bottom,
}




// ============================================================================
impl Face {

    pub const ALL: [Face; 6] = [
        Face::North,
        Face::East,
        Face::South,
        Face::West,
        Face::Top,
        Face::Bottom,
    ];

    /**
     * The faces that bound a block of the given dimensionality. Two-dimensional
     * blocks have no top or bottom.
     */
    pub fn active(dimensions: usize) -> &'static [Face] {
        if dimensions == 2 {
            &Self::ALL[..4]
        } else {
            &Self::ALL
        }
    }

    pub fn index(self) -> usize {
        match self {
            Face::North => 0,
            Face::East => 1,
            Face::South => 2,
            Face::West => 3,
            Face::Top => 4,
            Face::Bottom => 5,
        }
    }

    pub fn axis(self) -> Axis {
        match self {
            Face::East | Face::West => Axis::I,
            Face::North | Face::South => Axis::J,
            Face::Top | Face::Bottom => Axis::K,
        }
    }

    /**
     * Whether the face sits at the upper end of its axis (its outward normal
     * points in the positive direction).
     */
    pub fn is_upper(self) -> bool {
        matches!(self, Face::North | Face::East | Face::Top)
    }

    pub fn opposite(self) -> Face {
        match self {
            Face::North => Face::South,
            Face::South => Face::North,
            Face::East => Face::West,
            Face::West => Face::East,
            Face::Top => Face::Bottom,
            Face::Bottom => Face::Top,
        }
    }

    /**
     * Sign of the outward normal along the face's axis.
     */
    pub fn outward_sign(self) -> f64 {
        if self.is_upper() {
            1.0
        } else {
            -1.0
        }
    }
}
