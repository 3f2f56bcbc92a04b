use crate::num_vec::Vec3;

/// How an inbound record is folded into the local value.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Combine {
    Accumulate,
    Overwrite,
}

/// A per-node value made of a fixed number of doubles, which can be packed
/// into exchange messages and prorated by the constraint propagator.
///
pub trait Record: Copy {
    const FIELDS: usize;

    fn read_fields(&self, out: &mut [f64]);

    fn write_fields(&mut self, fields: &[f64], combine: Combine);

    fn zero(&mut self);
}

impl Record for Vec3 {
    const FIELDS: usize = 3;

    fn read_fields(&self, out: &mut [f64]) {
        out[..3].copy_from_slice(self.as_array());
    }

    fn write_fields(&mut self, fields: &[f64], combine: Combine) {
        for (x, y) in self.as_mut_array().iter_mut().zip(fields) {
            match combine {
                Combine::Accumulate => *x += y,
                Combine::Overwrite => *x = *y,
            }
        }
    }

    fn zero(&mut self) {
        *self = Vec3::zeros()
    }
}




/**
 * The wire layout of one record: its doubles, optionally followed by the
 * sending node's global id so the receiver can check that both sides
 * walked their nodes in the same order. All values are little-endian.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordLayout {
    pub fields: usize,
    pub with_global_id: bool,
}

impl RecordLayout {
    pub fn of<R: Record>(with_global_id: bool) -> Self {
        Self {
            fields: R::FIELDS,
            with_global_id,
        }
    }

    /// Bytes per record on the wire.
    pub fn size(&self) -> usize {
        8 * self.fields + if self.with_global_id { 8 } else { 0 }
    }

    /// Write a record into its slot of an outbound buffer. `scratch` must
    /// hold at least `fields` doubles.
    ///
    pub fn pack<R: Record>(&self, value: &R, gid: u64, slot: &mut [u8], scratch: &mut [f64]) {
        value.read_fields(scratch);
        for (chunk, x) in slot.chunks_exact_mut(8).zip(&scratch[..self.fields]) {
            chunk.copy_from_slice(&x.to_le_bytes());
        }
        if self.with_global_id {
            slot[8 * self.fields..8 * self.fields + 8].copy_from_slice(&gid.to_le_bytes());
        }
    }

    /// Read the doubles of a record slot into `scratch`, returning the
    /// global id it carries if the layout has one.
    ///
    pub fn unpack(&self, slot: &[u8], scratch: &mut [f64]) -> Option<u64> {
        for (x, chunk) in scratch[..self.fields].iter_mut().zip(slot.chunks_exact(8)) {
            *x = f64::from_le_bytes(to_array(chunk));
        }
        if self.with_global_id {
            Some(u64::from_le_bytes(to_array(&slot[8 * self.fields..])))
        } else {
            None
        }
    }
}

fn to_array(bytes: &[u8]) -> [u8; 8] {
    let mut array = [0; 8];
    array.copy_from_slice(&bytes[..8]);
    array
}




// ============================================================================
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(RecordLayout::of::<Vec3>(false).size(), 24);
        assert_eq!(RecordLayout::of::<Vec3>(true).size(), 32);
    }

    #[test]
    fn packed_record_carries_its_global_id() {
        let layout = RecordLayout::of::<Vec3>(true);
        let mut slot = vec![0; layout.size()];
        let mut scratch = [0.0; 3];

        layout.pack(&Vec3::new(1.0, -2.0, 0.5), 77, &mut slot, &mut scratch);
        scratch = [0.0; 3];
        assert_eq!(layout.unpack(&slot, &mut scratch), Some(77));
        assert_eq!(scratch, [1.0, -2.0, 0.5]);
    }

    #[test]
    fn combine_modes() {
        let mut v = Vec3::new(1.0, 1.0, 1.0);
        v.write_fields(&[1.0, 2.0, 3.0], Combine::Accumulate);
        assert_eq!(v, Vec3::new(2.0, 3.0, 4.0));
        v.write_fields(&[1.0, 2.0, 3.0], Combine::Overwrite);
        assert_eq!(v, Vec3::new(1.0, 2.0, 3.0));
        v.zero();
        assert_eq!(v, Vec3::zeros());
    }
}
