//! Fuzz bitmap coverage handler.

use super::HandleCoverage;

/// [`HandleCoverage`] implementor maintaining an AFL-compatible fuzzing
/// bitmap.
///
/// Every reconstructed block address is folded with the previous location
/// into a bitmap index whose cell is wrapping-incremented, the classic
/// `prev ^ cur` edge encoding.
pub struct FuzzBitmapCoverageHandler<M: AsRef<[u8]> + AsMut<[u8]>> {
    /// The fuzzing bitmap needed to be maintained
    fuzzing_bitmap: M,
    /// Previous location used for calculating the bitmap index
    prev_loc: u64,
}

impl<M: AsRef<[u8]> + AsMut<[u8]>> FuzzBitmapCoverageHandler<M> {
    /// Create a new fuzz bitmap coverage handler.
    ///
    /// You can pass things like `&mut [u8]`, `Vec<u8>`, `Box<[u8]>`, or even
    /// a mmapped structure.
    pub fn new(fuzzing_bitmap: M) -> Self {
        Self {
            fuzzing_bitmap,
            prev_loc: 0,
        }
    }

    /// Reset the edge chain between fuzz iterations.
    pub fn reset(&mut self) {
        self.prev_loc = 0;
    }

    /// Consume the handler and get the bitmap back
    pub fn into_inner(self) -> M {
        self.fuzzing_bitmap
    }

    /// Get fuzz bitmap size as a modulus for calculating the bitmap index
    fn bitmap_size_modulus(&self) -> u64 {
        self.fuzzing_bitmap.as_ref().len() as u64
    }
}

impl<M: AsRef<[u8]> + AsMut<[u8]>> HandleCoverage for FuzzBitmapCoverageHandler<M> {
    type Error = std::convert::Infallible;

    #[inline]
    #[expect(clippy::cast_possible_truncation)]
    fn on_block(&mut self, ip: u64) -> Result<(), Self::Error> {
        let bitmap_index = ((self.prev_loc ^ ip) % self.bitmap_size_modulus()) as usize;
        self.prev_loc = ip >> 1;
        let cell = &mut self.fuzzing_bitmap.as_mut()[bitmap_index];
        *cell = cell.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_fold_previous_location() {
        let mut handler = FuzzBitmapCoverageHandler::new(vec![0u8; 64]);
        handler.on_block(0x10).unwrap();
        handler.on_block(0x20).unwrap();
        let bitmap = handler.into_inner();
        // First block folds against prev_loc 0, second against 0x10 >> 1.
        assert_eq!(bitmap[0x10], 1);
        assert_eq!(bitmap[(0x10 >> 1) ^ 0x20], 1);
    }

    #[test]
    fn test_reset_restarts_the_chain() {
        let mut handler = FuzzBitmapCoverageHandler::new(vec![0u8; 64]);
        handler.on_block(0x10).unwrap();
        handler.reset();
        handler.on_block(0x10).unwrap();
        assert_eq!(handler.into_inner()[0x10], 2);
    }

    #[test]
    fn test_cell_wraps_instead_of_saturating() {
        let mut handler = FuzzBitmapCoverageHandler::new(vec![0xFFu8; 1]);
        handler.on_block(0x10).unwrap();
        assert_eq!(handler.into_inner()[0], 0);
    }
}
