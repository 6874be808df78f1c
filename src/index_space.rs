use core::ops::Range;
use crate::geometry::{Axis, Face};




/**
 * A cell index in a block: (i, j, k)
 */
pub type Index = (i64, i64, i64);




/**
 * Represents a rectangular region in a discrete 3D index space. Blocks in two
 * dimensions use a single layer on the k axis.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
    dk: Range<i64>,
}




/**
 * Describes a rectangular index space. The index type is signed 64-bit integer.
 */
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end && dk.start <= dk.end,
            "index space has negative volume");

        Self { di, dj, dk }
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize,
         (self.dk.end - self.dk.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m, n) = self.dim();
        l * m * n
    }


    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> Index {
        (self.di.start, self.dj.start, self.dk.start)
    }


    /**
     * Return the maximum index (exclusive).
     */
    pub fn end(&self) -> Index {
        (self.di.end, self.dj.end, self.dk.end)
    }


    /**
     * Return the range of indexes along the given axis.
     */
    pub fn range(&self, axis: Axis) -> Range<i64> {
        match axis {
            Axis::I => self.di.clone(),
            Axis::J => self.dj.clone(),
            Axis::K => self.dk.clone(),
        }
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: Index) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1) && self.dk.contains(&index.2)
    }


    /**
     * Expand this index space by the given number of elements on each of the
     * listed axes.
     */
    pub fn extend(&self, delta: i64, axes: &[Axis]) -> Self {
        let mut result = self.clone();
        for axis in axes {
            result = result.with_range(*axis, {
                let r = self.range(*axis);
                r.start - delta .. r.end + delta
            });
        }
        result
    }


    /**
     * Extend the upper end of this index space along one axis. Interface
     * index spaces are the cell space extended by one on their own axis.
     */
    pub fn extend_upper(&self, delta: i64, axis: Axis) -> Self {
        let r = self.range(axis);
        self.with_range(axis, r.start .. r.end + delta)
    }


    /**
     * Shift this index space by the given amount along one axis.
     */
    pub fn translate(&self, delta: i64, axis: Axis) -> Self {
        let r = self.range(axis);
        self.with_range(axis, r.start + delta .. r.end + delta)
    }


    /**
     * Return a single layer of this (interior) index space which is adjacent
     * to the given face. Depth zero is the layer touching the face.
     */
    pub fn interior_layer(&self, face: Face, depth: i64) -> Self {
        let axis = face.axis();
        let r = self.range(axis);
        let n = if face.is_upper() { r.end - 1 - depth } else { r.start + depth };
        self.with_range(axis, n .. n + 1)
    }


    /**
     * Return a single layer just outside the given face of this (interior)
     * index space. Depth zero is the ghost layer touching the face.
     */
    pub fn ghost_layer(&self, face: Face, depth: i64) -> Self {
        let axis = face.axis();
        let r = self.range(axis);
        let n = if face.is_upper() { r.end + depth } else { r.start - 1 - depth };
        self.with_range(axis, n .. n + 1)
    }


    /**
     * Return the linear offset for the given index, in a row-major memory
     * buffer aligned with the start of this index space.
     */
    pub fn row_major_offset(&self, index: Index) -> usize {
        let (_, m, n) = self.dim();
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let k = (index.2 - self.dk.start) as usize;
        (i * m + j) * n + k
    }


    /**
     * Return an iterator which traverses the index space in row-major order
     * (C-like; the final index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = Index> + '_ {
        self.di.clone().flat_map(move |i| {
            self.dj.clone().flat_map(move |j| self.dk.clone().map(move |k| (i, j, k)))
        })
    }


    fn with_range(&self, axis: Axis, range: Range<i64>) -> Self {
        match axis {
            Axis::I => Self::new(range, self.dj.clone(), self.dk.clone()),
            Axis::J => Self::new(self.di.clone(), range, self.dk.clone()),
            Axis::K => Self::new(self.di.clone(), self.dj.clone(), range),
        }
    }
}




/**
 * Less imposing factory function to construct an IndexSpace object.
 */
pub fn range3d(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> IndexSpace {
    IndexSpace::new(di, dj, dk)
}




/**
 * Step one index along the given axis.
 */
pub fn offset(index: Index, axis: Axis, delta: i64) -> Index {
    match axis {
        Axis::I => (index.0 + delta, index.1, index.2),
        Axis::J => (index.0, index.1 + delta, index.2),
        Axis::K => (index.0, index.1, index.2 + delta),
    }
}
