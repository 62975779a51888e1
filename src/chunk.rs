//! Splits a byte buffer into address-tagged chunks sized for one write
//! packet each.

/// One bounded slice of a larger image, tagged with its destination
/// address. Consumed by exactly one write packet.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct AddressedChunk<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

/// Lazy chunk sequence over a buffer, produced by [`split`].
#[derive(Clone, Debug)]
pub struct Chunks<'a> {
    address: u32,
    remaining: &'a [u8],
    chunk_size: usize,
}

/// Cover `data` in order with chunks of `chunk_size` bytes (the final one
/// may be short), addressed from `address` upwards by offset.
pub fn split(address: u32, data: &[u8], chunk_size: usize) -> Chunks<'_> {
    debug_assert!(chunk_size > 0);

    Chunks {
        address,
        remaining: data,
        chunk_size,
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = AddressedChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        let take = self.remaining.len().min(self.chunk_size);
        let (data, tail) = self.remaining.split_at(take);

        let chunk = AddressedChunk {
            address: self.address,
            data,
        };

        self.address += take as u32;
        self.remaining = tail;

        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_CHUNK;

    #[test]
    fn splits_with_final_short_chunk() {
        let data = [0u8; 100];
        let chunks: Vec<_> = split(0x1000, &data, MAX_CHUNK).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].address, chunks[0].data.len()), (0x1000, 56));
        assert_eq!((chunks[1].address, chunks[1].data.len()), (0x1038, 44));
    }

    #[test]
    fn exact_multiple_has_no_tail() {
        let data = [0u8; 112];
        let chunks: Vec<_> = split(0, &data, MAX_CHUNK).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].data.len(), 56);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert_eq!(split(0x1000, &[], MAX_CHUNK).next(), None);
    }

    #[test]
    fn chunks_are_contiguous_and_cover_the_input() {
        let data: Vec<u8> = (0..32_768u32).map(|i| i as u8).collect();
        let chunks: Vec<_> = split(0x0007_0000, &data, MAX_CHUNK).collect();

        // 585 full chunks plus an 8-byte tail
        assert_eq!(chunks.len(), 586);
        assert_eq!(chunks.last().unwrap().data.len(), 8);

        let total: usize = chunks.iter().map(|c| c.data.len()).sum();
        assert_eq!(total, data.len());

        for pair in chunks.windows(2) {
            assert_eq!(pair[0].address + pair[0].data.len() as u32, pair[1].address);
        }
    }

    #[test]
    fn chunk_data_is_the_matching_slice_of_the_input() {
        let data: Vec<u8> = (0..100u8).collect();

        for chunk in split(0x4000, &data, MAX_CHUNK) {
            let offset = (chunk.address - 0x4000) as usize;
            assert_eq!(chunk.data, &data[offset..offset + chunk.data.len()]);
        }
    }
}
