use primitives_commitment::piece::{PaddedPieceSize, UnpaddedPieceSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FillerError {
    #[error("remaining space of {0} bytes cannot be split into padded pieces")]
    UnalignedSpace(u64),
}

/// Computes the filler pieces needed to fill `remaining` unpadded bytes of a sector.
///
/// Pieces must be aligned on power of two boundaries (in padded terms), so every set bit of the
/// padded remaining space becomes one filler piece. Fillers are returned smallest first.
pub fn fillers_from_rem(remaining: u64) -> Result<Vec<UnpaddedPieceSize>, FillerError> {
    // Convert to in-sector bytes for easier math:
    //
    // Sector size to user bytes ratio is constant, e.g. for 1024B we have 1016B
    // of user-usable data.
    //
    // (1024/1016 = 128/127)
    let padded = remaining + (remaining / 127);

    let mut fillers = Vec::with_capacity(padded.count_ones() as usize);
    let mut bits = padded;
    while bits != 0 {
        let piece = 1u64 << bits.trailing_zeros();
        bits ^= piece;

        // Bits under the minimum piece size cannot be expressed as a piece
        let piece =
            PaddedPieceSize::new(piece).map_err(|_| FillerError::UnalignedSpace(remaining))?;
        fillers.push(piece.unpadded());
    }

    Ok(fillers)
}
