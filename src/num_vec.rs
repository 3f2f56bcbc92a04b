use core::ops::{Add, AddAssign, Div, Index, IndexMut, Mul, Neg, Sub};




/**
 * A statically-sized numeric vector over a generic scalar data type T, which
 * supports arithmetic operations also supported by T.
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vector<T, const DIM: usize> {
    data: [T; DIM],
}

/// Nodal force and displacement vectors.
pub type Vec3 = Vector<f64, 3>;




// ============================================================================
impl<T, const DIM: usize> Vector<T, DIM> {
    pub const fn from_array(data: [T; DIM]) -> Self {
        Self { data }
    }

    pub fn as_array(&self) -> &[T; DIM] {
        &self.data
    }

    pub fn as_mut_array(&mut self) -> &mut [T; DIM] {
        &mut self.data
    }
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { data: [x, y, z] }
    }

    pub const fn zeros() -> Self {
        Self { data: [0.0; 3] }
    }

    /// True if every component is within 1e-20 of zero. Element assembly
    /// skips the matrix products for such vectors.
    pub fn is_negligible(&self) -> bool {
        self.data.iter().all(|x| x.abs() <= 1e-20)
    }

    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |m: f64, x| m.max(x.abs()))
    }
}

impl<T: Copy + Default, const DIM: usize> Default for Vector<T, DIM> {
    fn default() -> Self {
        Self {
            data: [T::default(); DIM],
        }
    }
}




// ============================================================================
impl<T, U, V, const DIM: usize> Add<Vector<U, DIM>> for Vector<T, DIM>
where
    T: Copy + Add<U, Output = V>,
    U: Copy,
    V: Copy + Default,
{
    type Output = Vector<V, DIM>;

    fn add(self, other: Vector<U, DIM>) -> Self::Output {
        let mut data = [V::default(); DIM];

        for (i, x) in data.iter_mut().enumerate() {
            *x = self[i].add(other[i])
        }
        Self::Output { data }
    }
}

impl<T, U, V, const DIM: usize> Sub<Vector<U, DIM>> for Vector<T, DIM>
where
    T: Copy + Sub<U, Output = V>,
    U: Copy,
    V: Copy + Default,
{
    type Output = Vector<V, DIM>;

    fn sub(self, other: Vector<U, DIM>) -> Self::Output {
        let mut data = [V::default(); DIM];

        for (i, x) in data.iter_mut().enumerate() {
            *x = self[i].sub(other[i])
        }
        Self::Output { data }
    }
}

impl<T, U, V, const DIM: usize> Mul<U> for Vector<T, DIM>
where
    T: Copy + Mul<U, Output = V>,
    U: Copy,
    V: Copy + Default,
{
    type Output = Vector<V, DIM>;

    fn mul(self, other: U) -> Self::Output {
        let mut data = [V::default(); DIM];

        for (i, x) in data.iter_mut().enumerate() {
            *x = self[i].mul(other)
        }
        Self::Output { data }
    }
}

impl<T, U, V, const DIM: usize> Div<U> for Vector<T, DIM>
where
    T: Copy + Div<U, Output = V>,
    U: Copy,
    V: Copy + Default,
{
    type Output = Vector<V, DIM>;

    fn div(self, other: U) -> Self::Output {
        let mut data = [V::default(); DIM];

        for (i, x) in data.iter_mut().enumerate() {
            *x = self[i].div(other)
        }
        Self::Output { data }
    }
}

impl<T, const DIM: usize> Neg for Vector<T, DIM>
where
    T: Copy + Neg<Output = T>,
{
    type Output = Self;

    fn neg(mut self) -> Self::Output {
        for x in self.data.iter_mut() {
            *x = -*x
        }
        self
    }
}

impl<T, const DIM: usize> AddAssign for Vector<T, DIM>
where
    T: Copy + AddAssign,
{
    fn add_assign(&mut self, other: Self) {
        for (x, y) in self.data.iter_mut().zip(other.data) {
            *x += y
        }
    }
}




// ============================================================================
impl<T, const DIM: usize> Index<usize> for Vector<T, DIM> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl<T, const DIM: usize> IndexMut<usize> for Vector<T, DIM> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.data[index]
    }
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::Vec3;

    #[test]
    fn arithmetic_is_componentwise() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(0.5, 0.5, 0.5);
        assert_eq!(a + b, Vec3::new(1.5, 2.5, 3.5));
        assert_eq!(a - b, Vec3::new(0.5, 1.5, 2.5));
        assert_eq!(a * 2.0, Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(a / 2.0, Vec3::new(0.5, 1.0, 1.5));
        assert_eq!(-a, Vec3::new(-1.0, -2.0, -3.0));
    }

    #[test]
    fn add_assign_accumulates() {
        let mut a = Vec3::zeros();
        a += Vec3::new(1.0, 0.0, -1.0);
        a += Vec3::new(1.0, 0.0, -1.0);
        assert_eq!(a, Vec3::new(2.0, 0.0, -2.0));
        a[1] = 7.0;
        assert_eq!(a[1], 7.0);
    }

    #[test]
    fn negligible_vectors_are_detected() {
        assert!(Vec3::zeros().is_negligible());
        assert!(Vec3::new(1e-21, -1e-21, 0.0).is_negligible());
        assert!(!Vec3::new(0.0, 1e-19, 0.0).is_negligible());
    }
}
